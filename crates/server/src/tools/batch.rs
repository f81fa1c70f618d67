//! db_batch tool implementation.
//!
//! Runs a list of statements inside one transaction.

use std::time::Duration;

use kbstore_core::coordinator::Isolation;
use kbstore_core::rows::{SqlValue, json_to_sql};
use kbstore_core::{Error, ExecutionCoordinator, Rows, TransactionOptions};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::json_result;
use crate::error::ToolError;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
}

/// Input parameters for the db_batch tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DbBatchParams {
    /// Statements to run, in order.
    pub statements: Vec<BatchStatement>,

    /// Lock mode: "deferred" (default), "immediate" or "exclusive".
    #[serde(default)]
    pub isolation: Isolation,

    /// Abort and roll back after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Cache tags to invalidate after commit.
    #[serde(default)]
    pub invalidate_tags: Vec<String>,
}

/// Output structure for the db_batch tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbBatchOutput {
    /// One result per statement.
    pub results: Vec<Rows>,
}

/// Implementation of the db_batch tool.
pub async fn batch_impl(coord: &ExecutionCoordinator, params: DbBatchParams) -> Result<CallToolResult, McpError> {
    if params.statements.is_empty() {
        return Err(ToolError::InvalidInput("statements cannot be empty".into()).into());
    }
    if let Some(idx) = params.statements.iter().position(|s| s.sql.trim().is_empty()) {
        return Err(ToolError::InvalidInput(format!("statement {idx} is empty")).into());
    }

    let statements: Vec<(String, Vec<SqlValue>)> = params
        .statements
        .iter()
        .map(|s| (s.sql.clone(), s.params.iter().map(json_to_sql).collect()))
        .collect();
    let opts = TransactionOptions {
        isolation: params.isolation,
        timeout: params.timeout_ms.map(Duration::from_millis),
        ..Default::default()
    };

    let results = coord
        .transaction(opts, |tx| {
            let statements = statements.clone();
            async move {
                let mut results = Vec::with_capacity(statements.len());
                for (sql, values) in statements {
                    results.push(tx.query(&sql, values).await?);
                }
                Ok::<_, Error>(results)
            }
        })
        .await?;

    if !params.invalidate_tags.is_empty() {
        coord.cache().invalidate(None, &params.invalidate_tags).await?;
    }

    json_result(&DbBatchOutput { results })
}
