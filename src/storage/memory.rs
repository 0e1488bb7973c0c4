/// In-memory collaborators
///
/// Used by tests and for dry runs where no database should be touched. The flow version
/// store can be told to fail saves for chosen ids and counts every write it accepts.

use super::files::{FileMetadata, FileStore, FileType};
use super::flow_versions::{FlowVersionStore, TriggerUpdate};
use super::pieces::PieceVersionSource;
use crate::flow::{FlowVersion, SchemaVersion};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Flow versions kept in a map
#[derive(Debug, Default)]
pub struct MemoryFlowVersionStore {
    versions: RwLock<HashMap<String, FlowVersion>>,
    failing_saves: RwLock<HashSet<String>>,
    saves: AtomicUsize,
}

impl MemoryFlowVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, flow_version: FlowVersion) {
        self.versions
            .write()
            .await
            .insert(flow_version.id.clone(), flow_version);
    }

    pub async fn get(&self, id: &str) -> Option<FlowVersion> {
        self.versions.read().await.get(id).cloned()
    }

    /// Make every future save of `id` fail
    pub async fn fail_saves_for(&self, id: &str) {
        self.failing_saves.write().await.insert(id.to_string());
    }

    /// Number of successful `save_trigger` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowVersionStore for MemoryFlowVersionStore {
    async fn find_stale(&self, latest: SchemaVersion) -> Result<Vec<String>> {
        let versions = self.versions.read().await;
        let mut stale: Vec<String> = versions
            .values()
            .filter(|fv| match fv.parsed_schema_version() {
                Ok(Some(version)) => version < latest,
                // Unstamped and unparseable documents are left to the runner to classify
                Ok(None) | Err(_) => true,
            })
            .map(|fv| fv.id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    async fn load_by_id(&self, id: &str) -> Result<Option<FlowVersion>> {
        Ok(self.get(id).await)
    }

    async fn save_trigger(&self, id: &str, update: &TriggerUpdate) -> Result<()> {
        if self.failing_saves.read().await.contains(id) {
            anyhow::bail!("Simulated write failure for flow version {}", id);
        }

        let mut versions = self.versions.write().await;
        let flow_version = versions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Flow version not found: {}", id))?;

        flow_version.schema_version = Some(update.schema_version.clone());
        if let Some(trigger) = &update.trigger {
            flow_version.trigger = Some(trigger.clone());
        }
        flow_version.connection_ids = update.connection_ids.clone();
        flow_version.backup_files = update.backup_files.clone();

        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Files kept in a map, ids handed out sequentially
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, (FileMetadata, Vec<u8>)>>,
    next_id: AtomicUsize,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file under a caller-chosen id
    pub async fn insert(&self, id: &str, data: Vec<u8>, metadata: FileMetadata) {
        self.files.write().await.insert(id.to_string(), (metadata, data));
    }

    /// Number of stored files of a type
    pub async fn count(&self, file_type: FileType) -> usize {
        self.files
            .read()
            .await
            .values()
            .filter(|(metadata, _)| metadata.file_type == file_type)
            .count()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn save(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<String> {
        let id = format!("file-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.files.write().await.insert(id.clone(), (metadata, data));
        Ok(id)
    }

    async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.read().await.get(id).map(|(_, data)| data.clone()))
    }

    async fn find_backup(
        &self,
        flow_version_id: &str,
        schema_version: &str,
    ) -> Result<Option<String>> {
        let files = self.files.read().await;
        Ok(files
            .iter()
            .find(|(_, (metadata, _))| {
                metadata.file_type == FileType::FlowVersionBackup
                    && metadata.flow_version_id.as_deref() == Some(flow_version_id)
                    && metadata.schema_version.as_deref() == Some(schema_version)
            })
            .map(|(id, _)| id.clone()))
    }
}

/// Fixed piece versions
#[derive(Debug, Clone, Default)]
pub struct StaticPieceVersions {
    versions: HashMap<String, String>,
}

impl StaticPieceVersions {
    pub fn new<I, N, V>(versions: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            versions: versions
                .into_iter()
                .map(|(name, version)| (name.into(), version.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl PieceVersionSource for StaticPieceVersions {
    async fn latest_versions_by_name(&self) -> Result<HashMap<String, String>> {
        Ok(self.versions.clone())
    }
}
