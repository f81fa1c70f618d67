//! MCP server handler implementation.
//!
//! Routes tool calls to the implementations in [`crate::tools`], each of
//! which works against the shared coordinator or migration orchestrator.

use std::sync::Arc;

use kbstore_core::{ExecutionCoordinator, MigrationOrchestrator};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

use crate::tools::{
    batch::{DbBatchParams, batch_impl},
    cache::{CacheInvalidateParams, CacheStatsParams, invalidate_impl, stats_impl},
    migrations::{MigrationApplyParams, MigrationPlanParams, apply_impl, plan_impl, status_impl},
    pool::pool_stats_impl,
    query::{DbQueryParams, query_impl},
};

/// The main MCP server handler for kbstore.
#[derive(Clone)]
pub struct KbStoreServer {
    coordinator: Arc<ExecutionCoordinator>,
    migrations: Arc<MigrationOrchestrator>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl KbStoreServer {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, migrations: Arc<MigrationOrchestrator>) -> Self {
        Self { coordinator, migrations, tool_router: Self::tool_router() }
    }

    #[tool(description = "Run one SQL statement. Reads are served from the query cache when possible.")]
    async fn db_query(&self, params: Parameters<DbQueryParams>) -> Result<CallToolResult, McpError> {
        query_impl(&self.coordinator, params.0).await
    }

    #[tool(description = "Run several SQL statements in one transaction. All succeed or none do.")]
    async fn db_batch(&self, params: Parameters<DbBatchParams>) -> Result<CallToolResult, McpError> {
        batch_impl(&self.coordinator, params.0).await
    }

    #[tool(description = "Invalidate cached query results by key pattern (regex) and/or tags.")]
    async fn cache_invalidate(&self, params: Parameters<CacheInvalidateParams>) -> Result<CallToolResult, McpError> {
        invalidate_impl(self.coordinator.cache(), params.0).await
    }

    #[tool(description = "Query cache size and hit/miss counters.")]
    async fn cache_stats(&self, params: Parameters<CacheStatsParams>) -> Result<CallToolResult, McpError> {
        stats_impl(self.coordinator.cache(), params.0).await
    }

    #[tool(description = "Connection pool occupancy and lifetime counters.")]
    async fn pool_stats(&self) -> Result<CallToolResult, McpError> {
        pool_stats_impl(self.coordinator.pool())
    }

    #[tool(description = "Current schema version, applied migrations, and definition validation results.")]
    async fn migration_status(&self) -> Result<CallToolResult, McpError> {
        status_impl(&self.migrations).await
    }

    #[tool(description = "Plan the migrations up to a target version (default: latest) with risk assessment.")]
    async fn migration_plan(&self, params: Parameters<MigrationPlanParams>) -> Result<CallToolResult, McpError> {
        plan_impl(&self.migrations, params.0).await
    }

    #[tool(description = "Apply migrations up to a target version. Destructive plans need confirm=true.")]
    async fn migration_apply(&self, params: Parameters<MigrationApplyParams>) -> Result<CallToolResult, McpError> {
        apply_impl(&self.migrations, params.0).await
    }
}

impl ServerHandler for KbStoreServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "kbstore".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
