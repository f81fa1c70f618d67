//! db_query tool implementation.
//!
//! Runs one statement through the execution coordinator.

use std::time::Duration;

use kbstore_core::cache::Priority;
use kbstore_core::rows::json_to_sql;
use kbstore_core::{ExecutionCoordinator, QueryOptions};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::json_result;
use crate::error::ToolError;

/// Input parameters for the db_query tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DbQueryParams {
    /// The SQL statement. Use `?1`, `?2`, ... for parameters.
    pub sql: String,

    /// Positional parameters. Arrays and objects are bound as JSON text.
    #[serde(default)]
    pub params: Vec<JsonValue>,

    /// Serve reads from the cache and cache their results (default: true).
    #[serde(default = "default_true")]
    pub use_cache: bool,

    /// Explicit cache key. Defaults to a fingerprint of the statement and parameters.
    #[serde(default)]
    pub cache_key: Option<String>,

    /// Cache TTL in milliseconds. Defaults to the configured TTL.
    #[serde(default)]
    pub ttl_ms: Option<u64>,

    /// Tags attached to the cached result.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Cache priority: "low", "normal" (default) or "high".
    #[serde(default)]
    pub priority: Priority,

    /// Skip the cache lookup and recompute.
    #[serde(default)]
    pub force_refresh: bool,

    /// Cache tags to invalidate after a successful write.
    #[serde(default)]
    pub invalidate_tags: Vec<String>,

    /// Retries on lock contention. Defaults to the configured count.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Output structure for the db_query tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DbQueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    /// Rows changed by a write.
    pub rows_affected: usize,
    pub last_insert_rowid: Option<i64>,
    pub execution_time_ms: u64,
    pub from_cache: bool,
}

/// Implementation of the db_query tool.
pub async fn query_impl(coord: &ExecutionCoordinator, params: DbQueryParams) -> Result<CallToolResult, McpError> {
    if params.sql.trim().is_empty() {
        return Err(ToolError::InvalidInput("sql cannot be empty".into()).into());
    }

    let values = params.params.iter().map(json_to_sql).collect();
    let opts = QueryOptions {
        cache_key: params.cache_key,
        use_cache: params.use_cache,
        max_retries: params.max_retries,
        ttl: params.ttl_ms.map(Duration::from_millis),
        tags: params.tags,
        priority: params.priority,
        force_refresh: params.force_refresh,
        invalidate_tags: params.invalidate_tags,
    };

    let result = coord.query(&params.sql, values, opts).await?;
    tracing::debug!(from_cache = result.from_cache, rows = result.data.len(), "db_query finished");

    let output = DbQueryOutput {
        columns: result.data.columns,
        rows: result.data.rows,
        rows_affected: result.data.rows_affected,
        last_insert_rowid: result.data.last_insert_rowid,
        execution_time_ms: result.execution_time_ms,
        from_cache: result.from_cache,
    };
    json_result(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{coordinator, output};

    fn params(sql: &str, values: Vec<JsonValue>) -> DbQueryParams {
        serde_json::from_value(serde_json::json!({ "sql": sql, "params": values })).unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_select() {
        let (_dir, coord) = coordinator().await;
        let insert = query_impl(&coord, params("INSERT INTO notes (body) VALUES (?1)", vec!["hello".into()]))
            .await
            .unwrap();
        let inserted: DbQueryOutput = output(&insert);
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.last_insert_rowid, Some(1));

        let select = query_impl(&coord, params("SELECT id, body FROM notes", Vec::new())).await.unwrap();
        let selected: DbQueryOutput = output(&select);
        assert_eq!(selected.columns, vec!["id", "body"]);
        assert_eq!(selected.rows, vec![vec![serde_json::json!(1), serde_json::json!("hello")]]);
        assert!(!selected.from_cache);

        let again: DbQueryOutput =
            output(&query_impl(&coord, params("SELECT id, body FROM notes", Vec::new())).await.unwrap());
        assert!(again.from_cache);
    }

    #[tokio::test]
    async fn test_defaults_from_minimal_json() {
        let parsed = params("SELECT 1", Vec::new());
        assert!(parsed.use_cache);
        assert_eq!(parsed.priority, Priority::Normal);
        assert!(parsed.max_retries.is_none());
    }

    #[tokio::test]
    async fn test_empty_sql_rejected() {
        let (_dir, coord) = coordinator().await;
        let err = query_impl(&coord, params("   ", Vec::new())).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }

    #[tokio::test]
    async fn test_store_error_surfaces() {
        let (_dir, coord) = coordinator().await;
        let err = query_impl(&coord, params("SELECT * FROM missing", Vec::new())).await.unwrap_err();
        assert!(err.message.contains("DATABASE_ERROR"));
    }
}
