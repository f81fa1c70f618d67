//! pool_stats tool implementation.

use kbstore_core::ConnectionPool;
use rmcp::{ErrorData as McpError, model::CallToolResult};

use super::json_result;

pub fn pool_stats_impl(pool: &ConnectionPool) -> Result<CallToolResult, McpError> {
    json_result(&pool.stats())
}
