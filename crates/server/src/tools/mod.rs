//! MCP tool implementations.
//!
//! This module contains all tools exposed by the kbstore server. Each tool
//! returns its output as pretty-printed JSON text.

pub mod batch;
pub mod cache;
pub mod migrations;
pub mod pool;
pub mod query;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

use crate::error::ToolError;

/// Serialize `output` into a successful tool result.
pub(crate) fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output).map_err(ToolError::from)?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use kbstore_core::config::{AppConfig, StoreConfig};
    use kbstore_core::{ExecutionCoordinator, QueryOptions};
    use rmcp::model::CallToolResult;

    /// Coordinator over a fresh store with a `notes` table.
    pub(crate) async fn coordinator() -> (tempfile::TempDir, Arc<ExecutionCoordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            store: StoreConfig { path: dir.path().join("tools.db"), ..Default::default() },
            ..Default::default()
        };
        let coord = ExecutionCoordinator::open(&config).await.unwrap();
        coord
            .query("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)", Vec::new(), QueryOptions::default())
            .await
            .unwrap();
        (dir, Arc::new(coord))
    }

    /// Parse the JSON text of a tool result.
    pub(crate) fn output<T: serde::de::DeserializeOwned>(result: &CallToolResult) -> T {
        let content = serde_json::to_value(&result.content[0]).unwrap();
        let text = content.get("text").and_then(|v| v.as_str()).expect("Expected text field in content");
        serde_json::from_str(text).unwrap()
    }
}
