//! Versioned schema migrations.
//!
//! - [`definition`]: migration scripts, loaded from files or built in code
//! - [`manager`]: the `_migrations` ledger, planning, apply and rollback
//! - [`orchestrator`]: validated plan execution with compensating rollback

mod analysis;
pub mod definition;
pub mod manager;
pub mod orchestrator;
pub mod plan;
pub mod validator;

pub use analysis::{MigrationAssessment, assess};
pub use definition::{Migration, compute_checksum, load_dir};
pub use manager::{AppliedMigration, MigrationManager, ValidationIssue, ValidationReport};
pub use orchestrator::{
    ExecuteOptions, ExecutionReport, MigrationEvent, MigrationOrchestrator, MigrationOutcome, MigrationRun,
};
pub use plan::{MigrationPlan, RiskLevel};
pub use validator::{SchemaDiff, SchemaSnapshot, snapshot};
