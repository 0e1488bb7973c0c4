/// Migration Layer
///
/// Step schema migrations and the machinery that applies them:
/// - `Migration`: one upgrade to a single target schema version
/// - `MigrationRegistry`: the ordered chain of every known migration
/// - `MigrationRunner`: batch upgrade of stale flow versions in storage
/// - `migrations`: the concrete migrations shipped with this build

use crate::backup::BackupService;
use crate::error::MigrationError;
use crate::flow::{FlowVersion, SchemaVersion};
use crate::storage::FileStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// Ordered migration chain
pub mod registry;

// Batch runner over the document store
pub mod runner;

// Concrete migrations, one per schema version
pub mod migrations;

pub use registry::MigrationRegistry;
pub use runner::{DocumentFailure, MigrationReport, MigrationRunner, RunnerConfig};

/// A single step-schema upgrade
///
/// A migration receives a flow version stamped exactly one version below its target and
/// knows nothing about the other migrations in the chain.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Short identifier used in logs (e.g. "branch-to-router")
    fn name(&self) -> &'static str;

    /// The schema version this migration upgrades to
    fn target_schema_version(&self) -> SchemaVersion;

    /// Upgrade a flow version
    ///
    /// The returned document is either stamped with the target version or left with the
    /// input stamp for the runner to advance.
    async fn migrate(
        &self,
        flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError>;
}

/// Result of one migration on one document
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub flow_version: FlowVersion,
    /// Whether the step tree was modified
    pub tree_changed: bool,
}

impl Migrated {
    pub fn changed(flow_version: FlowVersion) -> Self {
        Self { flow_version, tree_changed: true }
    }

    pub fn unchanged(flow_version: FlowVersion) -> Self {
        Self { flow_version, tree_changed: false }
    }
}

/// Latest published version per piece, frozen for the duration of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceVersions {
    latest: HashMap<String, String>,
}

impl PieceVersions {
    pub fn new(latest: HashMap<String, String>) -> Self {
        Self { latest }
    }

    pub fn latest(&self, piece_name: &str) -> Option<&str> {
        self.latest.get(piece_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Everything a migration may read besides the document itself
#[derive(Clone)]
pub struct MigrationContext {
    pub files: Arc<dyn FileStore>,
    pub backups: BackupService,
    pub piece_versions: Arc<PieceVersions>,
    /// Upper bound for every storage call made on behalf of a migration
    pub io_timeout: Duration,
}

impl MigrationContext {
    pub fn new(
        files: Arc<dyn FileStore>,
        piece_versions: PieceVersions,
        io_timeout: Duration,
    ) -> Self {
        Self {
            backups: BackupService::new(files.clone()),
            files,
            piece_versions: Arc::new(piece_versions),
            io_timeout,
        }
    }

    /// Same context with backups held in memory instead of written
    pub fn read_only(mut self) -> Self {
        self.backups = BackupService::read_only(self.files.clone());
        self
    }

    /// Run a storage call under the I/O timeout, mapping failures to `MigrationError`
    pub async fn bounded<T, F>(
        &self,
        action: impl Into<String>,
        call: F,
    ) -> Result<T, MigrationError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        bounded(self.io_timeout, action, call).await
    }
}

/// Await `call` for at most `timeout`
pub async fn bounded<T, F>(
    timeout: Duration,
    action: impl Into<String>,
    call: F,
) -> Result<T, MigrationError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let action = action.into();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(MigrationError::storage(action, &e)),
        Err(_) => Err(MigrationError::Timeout { action, timeout }),
    }
}
