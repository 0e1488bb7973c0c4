/// Migration Runner
///
/// Upgrades every stale flow version in the document store:
/// - Loads the piece version snapshot once, before any document is touched
/// - Processes stale ids in fixed-size batches on a bounded worker pool
/// - Applies pending migrations to each document strictly in order
/// - Writes a document back only when its schema version moved
///
/// A failing document is logged, reported and left exactly as it was stored; the run
/// carries on with the rest.

use super::migrations::stamp;
use super::{bounded, MigrationContext, MigrationRegistry, PieceVersions};
use crate::error::{FailureKind, MigrationError};
use crate::flow::{FlowVersion, SchemaVersion};
use crate::storage::{FileStore, FlowVersionStore, PieceVersionSource, TriggerUpdate};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Runner tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Number of documents loaded per batch
    pub batch_size: usize,
    /// Number of documents migrated at the same time
    pub concurrency: usize,
    /// Upper bound for every call to a storage collaborator
    pub io_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 4,
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// A document the run could not migrate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFailure {
    pub flow_version_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one runner pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    /// Schema version documents were upgraded to
    pub target_schema_version: String,
    /// Stale ids returned by the document store
    pub candidates: usize,
    /// Documents upgraded and written back
    pub migrated: usize,
    /// Documents already at the latest version when reloaded
    pub unchanged: usize,
    /// Documents that disappeared between listing and loading
    pub skipped: usize,
    pub failures: Vec<DocumentFailure>,
    /// Whether the run stopped before reaching every candidate
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl MigrationReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

enum Outcome {
    Migrated,
    UpToDate,
    NotFound,
    Failed(DocumentFailure),
    Cancelled,
}

/// Result of running the pending chain on a document in memory
struct Upgraded {
    flow_version: FlowVersion,
    tree_changed: bool,
    stamp_changed: bool,
}

/// Applies the migration chain to stored flow versions
#[derive(Clone)]
pub struct MigrationRunner {
    store: Arc<dyn FlowVersionStore>,
    files: Arc<dyn FileStore>,
    pieces: Arc<dyn PieceVersionSource>,
    registry: MigrationRegistry,
    config: RunnerConfig,
}

impl MigrationRunner {
    pub fn new(
        store: Arc<dyn FlowVersionStore>,
        files: Arc<dyn FileStore>,
        pieces: Arc<dyn PieceVersionSource>,
        registry: MigrationRegistry,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            files,
            pieces,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Migrate every stale flow version
    ///
    /// Safe to run repeatedly: documents already at the latest version are never
    /// listed and never written.
    pub async fn migrate_all(&self) -> Result<MigrationReport> {
        let (_never_cancelled, cancel) = watch::channel(false);
        self.migrate_all_until(cancel).await
    }

    /// Migrate every stale flow version until `cancel` turns true
    ///
    /// Cancellation is checked before each document starts; documents already in flight
    /// finish and are written normally. Errors are returned only when the run cannot
    /// start at all (reference data or the stale listing failed to load).
    pub async fn migrate_all_until(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<MigrationReport> {
        let started = Instant::now();
        let latest = self.registry.latest();
        let timeout = self.config.io_timeout;

        let ctx = self.context().await?;
        let ids = bounded(
            timeout,
            "listing stale flow versions",
            self.store.find_stale(latest),
        )
        .await?;

        let mut report = MigrationReport {
            started_at: Utc::now(),
            target_schema_version: latest.to_string(),
            candidates: ids.len(),
            ..Default::default()
        };

        if ids.is_empty() {
            tracing::info!("✅ All flow versions are at schema version {}", latest);
            report.duration_ms = elapsed_ms(started);
            return Ok(report);
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = ids.len().div_ceil(batch_size);
        tracing::info!(
            "🔄 Migrating {} flow versions to schema version {} in {} batches",
            ids.len(),
            latest,
            total_batches
        );

        for (index, batch) in ids.chunks(batch_size).enumerate() {
            let outcomes: Vec<Outcome> = stream::iter(batch.to_vec())
                .map(|id| {
                    let runner = self.clone();
                    let ctx = ctx.clone();
                    let cancel = cancel.clone();
                    async move {
                        if *cancel.borrow() {
                            return Outcome::Cancelled;
                        }
                        runner.migrate_one(&id, &ctx).await
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    Outcome::Migrated => report.migrated += 1,
                    Outcome::UpToDate => report.unchanged += 1,
                    Outcome::NotFound => report.skipped += 1,
                    Outcome::Failed(failure) => report.failures.push(failure),
                    Outcome::Cancelled => report.cancelled = true,
                }
            }

            tracing::info!(
                "📦 Batch {}/{} done: {} migrated, {} unchanged, {} skipped, {} failed",
                index + 1,
                total_batches,
                report.migrated,
                report.unchanged,
                report.skipped,
                report.failed()
            );

            let more_batches = index + 1 < total_batches;
            if more_batches && *cancel.borrow() {
                report.cancelled = true;
                tracing::warn!(
                    "⏹️ Migration run cancelled after batch {}/{}",
                    index + 1,
                    total_batches
                );
                break;
            }
        }

        report.duration_ms = elapsed_ms(started);
        tracing::info!(
            "🎉 Migration run finished in {}ms: {} migrated, {} failed",
            report.duration_ms,
            report.migrated,
            report.failed()
        );

        Ok(report)
    }

    /// Upgrade a document in memory without writing it back
    ///
    /// Used on the read path so callers always see the latest schema. Backups the chain
    /// would take are held in memory for this call only; nothing is written.
    pub async fn upgrade(&self, flow_version: FlowVersion) -> Result<FlowVersion, MigrationError> {
        if !self.is_stale(&flow_version) {
            return Ok(flow_version);
        }

        let ctx = self
            .context()
            .await
            .map_err(|e| MigrationError::storage("loading piece versions", &e))?
            .read_only();
        let mut upgraded = self.apply_chain(flow_version, &ctx).await?.flow_version;
        upgraded.connection_ids = upgraded.referenced_connections();
        Ok(upgraded)
    }

    fn is_stale(&self, flow_version: &FlowVersion) -> bool {
        match flow_version.parsed_schema_version() {
            Ok(Some(version)) => version < self.registry.latest(),
            Ok(None) | Err(_) => true,
        }
    }

    async fn context(&self) -> Result<MigrationContext> {
        let latest = bounded(
            self.config.io_timeout,
            "loading piece versions",
            self.pieces.latest_versions_by_name(),
        )
        .await?;

        let piece_versions = PieceVersions::new(latest);
        if piece_versions.is_empty() {
            tracing::warn!("⚠️ No piece versions available, piece steps will fail to resolve");
        } else {
            tracing::debug!("📚 Loaded latest versions of {} pieces", piece_versions.len());
        }

        Ok(MigrationContext::new(
            self.files.clone(),
            piece_versions,
            self.config.io_timeout,
        ))
    }

    async fn migrate_one(&self, id: &str, ctx: &MigrationContext) -> Outcome {
        match self.migrate_document(id, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let kind = e.kind();
                match kind {
                    FailureKind::MalformedInput => {
                        tracing::warn!("⚠️ Skipping flow version {}: {}", id, e)
                    }
                    FailureKind::UnresolvedDependency
                    | FailureKind::EngineDefect
                    | FailureKind::Persistence => {
                        tracing::error!("❌ Failed to migrate flow version {}: {}", id, e)
                    }
                }
                Outcome::Failed(DocumentFailure {
                    flow_version_id: id.to_string(),
                    kind,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn migrate_document(
        &self,
        id: &str,
        ctx: &MigrationContext,
    ) -> Result<Outcome, MigrationError> {
        let Some(flow_version) = self.load(id).await? else {
            tracing::debug!("🔍 Flow version {} no longer exists", id);
            return Ok(Outcome::NotFound);
        };

        let upgraded = self.apply_chain(flow_version, ctx).await?;
        if !upgraded.stamp_changed {
            return Ok(Outcome::UpToDate);
        }

        let flow_version = upgraded.flow_version;
        let update = TriggerUpdate {
            schema_version: flow_version.schema_version.clone().unwrap_or_default(),
            trigger: if upgraded.tree_changed { flow_version.trigger.clone() } else { None },
            connection_ids: flow_version.referenced_connections(),
            backup_files: flow_version.backup_files.clone(),
        };

        bounded(
            self.config.io_timeout,
            format!("saving flow version {}", id),
            self.store.save_trigger(id, &update),
        )
        .await?;

        tracing::info!(
            "✅ Migrated flow version {} to schema version {}{}",
            id,
            update.schema_version,
            if upgraded.tree_changed { "" } else { " (stamp only)" }
        );
        Ok(Outcome::Migrated)
    }

    async fn load(&self, id: &str) -> Result<Option<FlowVersion>, MigrationError> {
        let timeout = self.config.io_timeout;
        let action = format!("loading flow version {}", id);
        match tokio::time::timeout(timeout, self.store.load_by_id(id)).await {
            Ok(Ok(flow_version)) => Ok(flow_version),
            Ok(Err(e)) if e.downcast_ref::<serde_json::Error>().is_some() => {
                Err(MigrationError::malformed(id, format!("{:#}", e)))
            }
            Ok(Err(e)) => Err(MigrationError::storage(action, &e)),
            Err(_) => Err(MigrationError::Timeout { action, timeout }),
        }
    }

    /// Run every pending migration on `flow_version`
    ///
    /// The stamp is rewritten in canonical form first, so backups are keyed the same way
    /// they are looked up ("07" is stored as "7").
    async fn apply_chain(
        &self,
        mut flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Upgraded, MigrationError> {
        let original_stamp = flow_version.schema_version.clone();
        let baseline = self.registry.baseline();

        let current = match flow_version.parsed_schema_version() {
            Ok(Some(version)) => version,
            Ok(None) => baseline,
            Err(e) => return Err(MigrationError::malformed(&flow_version.id, e)),
        };
        stamp(&mut flow_version, current);

        if current < baseline {
            return Err(MigrationError::UnsupportedSchemaVersion {
                flow_version_id: flow_version.id.clone(),
                schema_version: current.to_string(),
                baseline: baseline.to_string(),
            });
        }

        let mut tree_changed = false;
        for migration in self.registry.pending(current) {
            let target = migration.target_schema_version();
            let input_stamp = flow_version.schema_version.clone();

            let migrated = migration.migrate(flow_version, ctx).await?;
            flow_version = migrated.flow_version;
            tree_changed |= migrated.tree_changed;

            check_stamp(migration.name(), target, &input_stamp, &mut flow_version)?;
            tracing::debug!(
                "➡️ {} applied to flow version {} (tree {})",
                migration.name(),
                flow_version.id,
                if migrated.tree_changed { "changed" } else { "untouched" }
            );
        }

        Ok(Upgraded {
            stamp_changed: flow_version.schema_version != original_stamp,
            flow_version,
            tree_changed,
        })
    }
}

/// Accept a document stamped with `target`, or advance one the migration left alone
fn check_stamp(
    migration: &str,
    target: SchemaVersion,
    input_stamp: &Option<String>,
    flow_version: &mut FlowVersion,
) -> Result<(), MigrationError> {
    if flow_version.schema_version == *input_stamp {
        stamp(flow_version, target);
        return Ok(());
    }

    let expected = target.to_string();
    match flow_version.schema_version.as_deref() {
        Some(actual) if actual == expected => Ok(()),
        actual => Err(MigrationError::VersionMismatch {
            migration: migration.to_string(),
            expected,
            actual: actual.unwrap_or("none").to_string(),
        }),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
