//! Executes migration plans safely against a live pool.
//!
//! A run holds the pool's exclusive admission for its whole duration, so
//! regular queries queue behind it instead of seeing a half-migrated schema,
//! and keeps one writer lease throughout. Each migration is pre-validated,
//! applied in its own transaction, then post-validated. When any step fails,
//! the migrations applied by this run are rolled back newest first.
//!
//! An attached query cache is emptied when the run takes admission and again,
//! persisted tier included, before admission is released.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::definition::Migration;
use super::manager::{AppliedMigration, MigrationManager, apply_on, current_version_on, revert_on};
use super::plan::MigrationPlan;
use super::validator::{SchemaDiff, post_validate, pre_validate, snapshot};
use crate::Error;
use crate::cache::QueryCache;
use crate::config::MigrationConfig;
use crate::pool::{PooledConnection, Role};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Acknowledges destructive migrations.
    pub confirmed: bool,
    /// Pre-validate the whole plan without applying anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
    Validated,
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRun {
    pub version: i64,
    pub description: String,
    pub outcome: MigrationOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_diff: Option<SchemaDiff>,
}

impl MigrationRun {
    fn pending(m: &Migration) -> Self {
        Self {
            version: m.version,
            description: m.description.clone(),
            outcome: MigrationOutcome::NotAttempted,
            duration_ms: 0,
            error: None,
            schema_diff: None,
        }
    }
}

/// Result of [`MigrationOrchestrator::execute_plan`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub from_version: i64,
    pub target_version: i64,
    pub final_version: i64,
    pub dry_run: bool,
    pub success: bool,
    pub migrations: Vec<MigrationRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    /// Turn a failed run into an error.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.success {
            return Ok(self);
        }
        Err(Error::MigrationFailed(self.error.unwrap_or_else(|| "migration run failed".to_string())))
    }

    pub fn versions_with(&self, outcome: MigrationOutcome) -> Vec<i64> {
        self.migrations.iter().filter(|r| r.outcome == outcome).map(|r| r.version).collect()
    }
}

/// Progress notifications published while a plan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    PlanStarted { from_version: i64, target_version: i64, count: usize, dry_run: bool },
    MigrationStarted { version: i64 },
    MigrationApplied { version: i64, duration_ms: u64 },
    MigrationFailed { version: i64, error: String },
    MigrationRolledBack { version: i64 },
    PlanFinished { success: bool, final_version: i64 },
}

#[derive(Debug)]
pub struct MigrationOrchestrator {
    manager: MigrationManager,
    cache: Option<Arc<QueryCache>>,
    events: broadcast::Sender<MigrationEvent>,
    require_confirmation: bool,
}

impl MigrationOrchestrator {
    pub fn new(manager: MigrationManager, config: &MigrationConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { manager, cache: None, events, require_confirmation: config.require_confirmation_for_destructive }
    }

    /// Clear `cache` after runs that changed the schema.
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn manager(&self) -> &MigrationManager {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MigrationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Plan up to the latest definition and execute it.
    pub async fn migrate_to_latest(&self, opts: ExecuteOptions) -> Result<ExecutionReport, Error> {
        let plan = self.manager.plan_latest().await?;
        self.execute_plan(&plan, opts).await
    }

    /// Run `plan`.
    ///
    /// Returns `Err` when the plan is refused before anything runs: the
    /// definitions fail validation, the plan would open a sequence gap wider
    /// than the tolerance, confirmation is missing, or the store moved since
    /// planning. A run that fails part-way still returns `Ok`
    /// with the outcome of every migration; use
    /// [`ExecutionReport::into_result`] to treat it as an error.
    pub async fn execute_plan(&self, plan: &MigrationPlan, opts: ExecuteOptions) -> Result<ExecutionReport, Error> {
        let started = Instant::now();
        self.manager.validate().await?.into_result()?;
        check_order(plan)?;
        self.manager.check_plan_gaps(plan)?;

        let destructive = plan.destructive_versions();
        if self.require_confirmation && !destructive.is_empty() && !opts.confirmed && !opts.dry_run {
            return Err(Error::ConfirmationRequired { versions: destructive });
        }

        let pool = self.manager.pool();
        let admission = pool.exclusive().await;
        // Memory hits never reach the pool, so they are not held back by
        // admission.
        if !opts.dry_run
            && let Some(cache) = &self.cache
        {
            cache.begin_schema_change();
        }
        let conn = pool.acquire_exclusive(Role::Writer, &admission).await?;

        let current = current_version_on(&conn).await?;
        if current != plan.from_version {
            return Err(Error::StalePlan { planned: plan.from_version, current });
        }

        self.emit(MigrationEvent::PlanStarted {
            from_version: plan.from_version,
            target_version: plan.to_version,
            count: plan.migrations.len(),
            dry_run: opts.dry_run,
        });
        tracing::info!(
            from = plan.from_version,
            to = plan.to_version,
            count = plan.migrations.len(),
            risk = ?plan.risk_level,
            dry_run = opts.dry_run,
            "executing migration plan"
        );

        let mut report = ExecutionReport {
            from_version: plan.from_version,
            target_version: plan.to_version,
            final_version: current,
            dry_run: opts.dry_run,
            success: true,
            migrations: plan.migrations.iter().map(MigrationRun::pending).collect(),
            error: None,
            duration_ms: 0,
        };

        let mut applied = Vec::new();
        if opts.dry_run {
            self.dry_run(&conn, plan, &mut report).await;
        } else {
            self.apply_all(&conn, plan, &mut report, &mut applied).await;
        }

        report.final_version = current_version_on(&conn).await?;
        if !applied.is_empty()
            && let Some(cache) = &self.cache
        {
            let cleared = cache.purge_on(&conn).await;
            tracing::debug!(cleared, "query cache cleared after schema change");
        }
        drop(conn);
        drop(admission);

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.emit(MigrationEvent::PlanFinished { success: report.success, final_version: report.final_version });
        if report.success {
            tracing::info!(final_version = report.final_version, duration_ms = report.duration_ms, "migration plan finished");
        } else {
            tracing::error!(
                final_version = report.final_version,
                error = report.error.as_deref().unwrap_or_default(),
                "migration plan failed"
            );
        }
        Ok(report)
    }

    async fn dry_run(&self, conn: &PooledConnection, plan: &MigrationPlan, report: &mut ExecutionReport) {
        let failed_version = match pre_validate(conn, &plan.migrations).await {
            Ok(()) => None,
            Err(e) => {
                let version = match &e {
                    Error::MigrationValidation { version, .. } => Some(*version),
                    _ => None,
                };
                report.success = false;
                report.error = Some(e.to_string());
                version
            }
        };

        for run in &mut report.migrations {
            match failed_version {
                Some(v) if run.version == v => {
                    run.outcome = MigrationOutcome::Failed;
                    run.error = report.error.clone();
                }
                Some(v) if run.version > v => {}
                None if !report.success => {}
                _ => run.outcome = MigrationOutcome::Validated,
            }
        }
    }

    async fn apply_all(
        &self, conn: &PooledConnection, plan: &MigrationPlan, report: &mut ExecutionReport,
        applied: &mut Vec<AppliedMigration>,
    ) {
        for (idx, m) in plan.migrations.iter().enumerate() {
            self.emit(MigrationEvent::MigrationStarted { version: m.version });
            let step_started = Instant::now();
            let result = apply_step(conn, m, applied).await;
            let run = &mut report.migrations[idx];
            run.duration_ms = step_started.elapsed().as_millis() as u64;

            match result {
                Ok(diff) => {
                    run.outcome = MigrationOutcome::Applied;
                    run.schema_diff = Some(diff);
                    self.emit(MigrationEvent::MigrationApplied { version: m.version, duration_ms: run.duration_ms });
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(version = m.version, error = %message, "migration failed, rolling back this run");
                    run.outcome = MigrationOutcome::Failed;
                    run.error = Some(message.clone());
                    report.success = false;
                    report.error = Some(message.clone());
                    self.emit(MigrationEvent::MigrationFailed { version: m.version, error: message });
                    self.compensate(conn, report, applied, m.version).await;
                    return;
                }
            }
        }
    }

    /// Undo this run's migrations, newest first. Stops at the first rollback
    /// that fails; the versions below it stay applied.
    async fn compensate(
        &self, conn: &PooledConnection, report: &mut ExecutionReport, applied: &[AppliedMigration], failed: i64,
    ) {
        for (idx, record) in applied.iter().enumerate().rev() {
            let run = report.migrations.iter_mut().find(|r| r.version == record.version);
            match revert_on(conn, record).await {
                Ok(()) => {
                    if let Some(run) = run
                        && run.version != failed
                    {
                        run.outcome = MigrationOutcome::RolledBack;
                    }
                    self.emit(MigrationEvent::MigrationRolledBack { version: record.version });
                }
                Err(e) => {
                    let remaining: Vec<i64> = applied[..=idx].iter().rev().map(|r| r.version).collect();
                    let failure = Error::MigrationRollbackFailure {
                        version: record.version,
                        remaining,
                        reason: e.to_string(),
                    };
                    tracing::error!(version = record.version, error = %failure, "compensating rollback stopped");
                    if let Some(run) = run {
                        run.outcome = MigrationOutcome::RollbackFailed;
                        run.error = Some(failure.to_string());
                    }
                    let original = report.error.take().unwrap_or_default();
                    report.error = Some(format!("{original}; {failure}"));
                    return;
                }
            }
        }
    }
}

fn check_order(plan: &MigrationPlan) -> Result<(), Error> {
    for pair in plan.migrations.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(Error::MigrationValidation {
                version: pair[1].version,
                reason: "plan is not in ascending version order".into(),
            });
        }
    }
    if let Some(first) = plan.migrations.first()
        && first.version <= plan.from_version
    {
        return Err(Error::MigrationAlreadyApplied { version: first.version });
    }
    Ok(())
}

/// Pre-validate, apply and post-validate one migration. Pushes the ledger
/// record onto `applied` as soon as the migration commits.
async fn apply_step(
    conn: &PooledConnection, migration: &Migration, applied: &mut Vec<AppliedMigration>,
) -> Result<SchemaDiff, Error> {
    pre_validate(conn, std::slice::from_ref(migration)).await?;
    let before = snapshot(conn).await?;
    let record = apply_on(conn, migration).await?;
    applied.push(record);
    let after = snapshot(conn).await?;
    post_validate(conn, migration).await?;
    Ok(before.diff(&after))
}
