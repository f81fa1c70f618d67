//! Upgrade plans.

use serde::Serialize;

use super::analysis::{MigrationAssessment, assess};
use super::definition::Migration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Ordered set of migrations taking the store from one version to another.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub from_version: i64,
    pub to_version: i64,
    /// Ascending by version.
    pub migrations: Vec<Migration>,
    pub estimated_duration_ms: u64,
    pub risk_level: RiskLevel,
    pub requires_downtime: bool,
    /// Versions in the order they would be rolled back.
    pub rollback_plan: Vec<i64>,
    pub assessments: Vec<MigrationAssessment>,
}

impl MigrationPlan {
    /// Build a plan over `migrations`, which must already be ascending.
    pub(crate) fn new(from_version: i64, to_version: i64, migrations: Vec<Migration>) -> Self {
        let assessments: Vec<MigrationAssessment> = migrations.iter().map(assess).collect();
        let risk_level = assessments.iter().map(|a| a.risk_level).max().unwrap_or(RiskLevel::Low);
        let requires_downtime = assessments.iter().any(|a| a.destructive);
        let estimated_duration_ms = assessments.iter().map(|a| a.estimated_duration_ms).sum();
        let rollback_plan = migrations.iter().rev().map(|m| m.version).collect();

        Self {
            from_version,
            to_version,
            migrations,
            estimated_duration_ms,
            risk_level,
            requires_downtime,
            rollback_plan,
            assessments,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.migrations.iter().map(|m| m.version).collect()
    }

    /// Versions that drop tables or columns.
    pub fn destructive_versions(&self) -> Vec<i64> {
        self.assessments.iter().filter(|a| a.destructive).map(|a| a.version).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_aggregates_assessments() {
        let plan = MigrationPlan::new(
            0,
            3,
            vec![
                Migration::new(1, "create", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;"),
                Migration::new(2, "backfill", "UPDATE a SET id = id;", ""),
                Migration::new(3, "drop", "DROP TABLE old;", "CREATE TABLE old (id INTEGER);"),
            ],
        );
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert!(plan.requires_downtime);
        assert_eq!(plan.rollback_plan, vec![3, 2, 1]);
        assert_eq!(plan.destructive_versions(), vec![3]);
        assert_eq!(plan.estimated_duration_ms, 10 + 500 + 10);
    }

    #[test]
    fn test_empty_plan_is_low_risk() {
        let plan = MigrationPlan::new(2, 2, Vec::new());
        assert!(plan.is_empty());
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert!(!plan.requires_downtime);
    }
}
