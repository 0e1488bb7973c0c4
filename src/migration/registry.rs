/// Ordered chain of step-schema migrations

use super::migrations::{
    BranchToRouter, BumpPieceVersions, ErrorHandlingDefaults, InlineCodeArtifacts,
    RecoverRouterChildren,
};
use super::Migration;
use crate::flow::SchemaVersion;
use anyhow::Result;
use std::sync::Arc;

/// Oldest schema version the shipped chain upgrades from
pub const BASELINE_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(7);

/// Migrations sorted by target version, each exactly one above the previous
#[derive(Clone)]
pub struct MigrationRegistry {
    baseline: SchemaVersion,
    migrations: Vec<Arc<dyn Migration>>,
}

impl MigrationRegistry {
    /// Build a registry, rejecting chains with gaps, duplicates or out-of-order targets
    pub fn new(baseline: SchemaVersion, migrations: Vec<Arc<dyn Migration>>) -> Result<Self> {
        let mut expected = baseline;
        for migration in &migrations {
            expected = SchemaVersion::new(expected.get() + 1);
            let target = migration.target_schema_version();
            if target != expected {
                anyhow::bail!(
                    "Migration {} targets schema version {}, expected {}",
                    migration.name(),
                    target,
                    expected
                );
            }
        }

        Ok(Self { baseline, migrations })
    }

    /// Every migration shipped with this build
    pub fn standard() -> Self {
        Self {
            baseline: BASELINE_SCHEMA_VERSION,
            migrations: vec![
                Arc::new(BranchToRouter),
                Arc::new(RecoverRouterChildren),
                Arc::new(InlineCodeArtifacts),
                Arc::new(ErrorHandlingDefaults),
                Arc::new(BumpPieceVersions),
            ],
        }
    }

    pub fn baseline(&self) -> SchemaVersion {
        self.baseline
    }

    /// Version a fully migrated document carries
    pub fn latest(&self) -> SchemaVersion {
        self.migrations
            .last()
            .map(|m| m.target_schema_version())
            .unwrap_or(self.baseline)
    }

    /// Migrations still to apply to a document at `from`, in order
    pub fn pending(&self, from: SchemaVersion) -> &[Arc<dyn Migration>] {
        let applied = self
            .migrations
            .iter()
            .take_while(|m| m.target_schema_version() <= from)
            .count();
        &self.migrations[applied..]
    }

    pub fn migrations(&self) -> &[Arc<dyn Migration>] {
        &self.migrations
    }
}
