//! Migration tools: status, plan and apply.
//!
//! All three work against the shared [`MigrationOrchestrator`]. Applying
//! takes exclusive access to the store for the duration of the run.

use kbstore_core::migrations::{AppliedMigration, ExecuteOptions, ValidationReport};
use kbstore_core::{MigrationOrchestrator, MigrationPlan};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::json_result;
use crate::error::ToolError;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusOutput {
    pub current_version: i64,
    pub latest_version: i64,
    pub pending: usize,
    pub applied: Vec<AppliedMigration>,
    pub validation: ValidationReport,
}

pub async fn status_impl(migrations: &MigrationOrchestrator) -> Result<CallToolResult, McpError> {
    let manager = migrations.manager();
    let current_version = manager.current_version().await?;
    let pending = manager.definitions().iter().filter(|m| m.version > current_version).count();

    json_result(&MigrationStatusOutput {
        current_version,
        latest_version: manager.latest_version(),
        pending,
        applied: manager.applied().await?,
        validation: manager.validate().await?,
    })
}

/// Parameters for the migration_plan tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MigrationPlanParams {
    /// Version to migrate to. Defaults to the latest defined version.
    #[serde(default)]
    pub target: Option<i64>,
}

/// Parameters for the migration_apply tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MigrationApplyParams {
    /// Version to migrate to. Defaults to the latest defined version.
    #[serde(default)]
    pub target: Option<i64>,

    /// Acknowledge migrations that drop tables or columns.
    #[serde(default)]
    pub confirm: bool,

    /// Validate the plan against the store and roll everything back.
    #[serde(default)]
    pub dry_run: bool,
}

async fn build_plan(migrations: &MigrationOrchestrator, target: Option<i64>) -> Result<MigrationPlan, McpError> {
    let manager = migrations.manager();
    let plan = match target {
        Some(t) if t < 0 => return Err(ToolError::InvalidInput(format!("target must be >= 0, got {t}")).into()),
        Some(t) => manager.plan(t).await?,
        None => manager.plan_latest().await?,
    };
    Ok(plan)
}

pub async fn plan_impl(
    migrations: &MigrationOrchestrator, params: MigrationPlanParams,
) -> Result<CallToolResult, McpError> {
    let plan = build_plan(migrations, params.target).await?;
    json_result(&plan)
}

/// Plan and execute in one step.
///
/// A run that fails part-way is still reported as a successful tool call;
/// the report's `success` flag and per-migration outcomes describe what
/// happened and what was rolled back.
pub async fn apply_impl(
    migrations: &MigrationOrchestrator, params: MigrationApplyParams,
) -> Result<CallToolResult, McpError> {
    let plan = build_plan(migrations, params.target).await?;
    let opts = ExecuteOptions { confirmed: params.confirm, dry_run: params.dry_run };
    let report = migrations.execute_plan(&plan, opts).await?;
    if !report.success {
        tracing::warn!(error = ?report.error, final_version = report.final_version, "migration run failed");
    }
    json_result(&report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{coordinator, output};
    use kbstore_core::config::MigrationConfig;
    use kbstore_core::migrations::Migration;
    use kbstore_core::{ExecutionCoordinator, MigrationManager};
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    fn definitions() -> Vec<Migration> {
        vec![
            Migration::new(1, "create tags", "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)", "DROP TABLE tags"),
            Migration::new(
                2,
                "index tags",
                "CREATE INDEX idx_tags_name ON tags(name)",
                "DROP INDEX idx_tags_name",
            ),
            Migration::new(3, "drop notes", "DROP TABLE notes", ""),
        ]
    }

    async fn orchestrator(coord: &Arc<ExecutionCoordinator>) -> MigrationOrchestrator {
        let config = MigrationConfig::default();
        let manager = MigrationManager::new(coord.pool().clone(), definitions()).await.unwrap();
        MigrationOrchestrator::new(manager, &config).with_cache(coord.cache().clone())
    }

    #[tokio::test]
    async fn test_status_before_and_after_apply() {
        let (_dir, coord) = coordinator().await;
        let migrations = orchestrator(&coord).await;

        let status: JsonValue = output(&status_impl(&migrations).await.unwrap());
        assert_eq!(status["current_version"], 0);
        assert_eq!(status["latest_version"], 3);
        assert_eq!(status["pending"], 3);
        assert_eq!(status["validation"]["valid"], true);

        let params = MigrationApplyParams { target: Some(2), ..Default::default() };
        apply_impl(&migrations, params).await.unwrap();

        let status: JsonValue = output(&status_impl(&migrations).await.unwrap());
        assert_eq!(status["current_version"], 2);
        assert_eq!(status["pending"], 1);
        assert_eq!(status["applied"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_plan_flags_destructive_migration() {
        let (_dir, coord) = coordinator().await;
        let migrations = orchestrator(&coord).await;

        let plan: JsonValue = output(&plan_impl(&migrations, MigrationPlanParams::default()).await.unwrap());
        assert_eq!(plan["from_version"], 0);
        assert_eq!(plan["to_version"], 3);
        assert_eq!(plan["requires_downtime"], true);
        assert_eq!(plan["rollback_plan"], serde_json::json!([3, 2, 1]));

        let partial: JsonValue =
            output(&plan_impl(&migrations, MigrationPlanParams { target: Some(1) }).await.unwrap());
        assert_eq!(partial["migrations"].as_array().unwrap().len(), 1);
        assert_eq!(partial["requires_downtime"], false);
    }

    #[tokio::test]
    async fn test_invalid_targets() {
        let (_dir, coord) = coordinator().await;
        let migrations = orchestrator(&coord).await;

        let err = plan_impl(&migrations, MigrationPlanParams { target: Some(-1) }).await.unwrap_err();
        assert_eq!(err.code.0, -32602);

        let err = plan_impl(&migrations, MigrationPlanParams { target: Some(0) }).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }

    #[tokio::test]
    async fn test_destructive_apply_needs_confirm() {
        let (_dir, coord) = coordinator().await;
        let migrations = orchestrator(&coord).await;

        let err = apply_impl(&migrations, MigrationApplyParams::default()).await.unwrap_err();
        assert!(err.message.contains("CONFIRMATION_REQUIRED"));
        assert_eq!(migrations.manager().current_version().await.unwrap(), 0);

        let params = MigrationApplyParams { confirm: true, ..Default::default() };
        let report: JsonValue = output(&apply_impl(&migrations, params).await.unwrap());
        assert_eq!(report["success"], true);
        assert_eq!(report["final_version"], 3);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_store_untouched() {
        let (_dir, coord) = coordinator().await;
        let migrations = orchestrator(&coord).await;

        let params = MigrationApplyParams { target: Some(2), dry_run: true, ..Default::default() };
        let report: JsonValue = output(&apply_impl(&migrations, params).await.unwrap());
        assert_eq!(report["dry_run"], true);
        assert_eq!(report["success"], true);
        assert_eq!(report["final_version"], 0);
        assert_eq!(migrations.manager().current_version().await.unwrap(), 0);
    }
}
