/// Flow version backups
///
/// A backup is the full JSON of a flow version, written to the file store right before a
/// lossy migration and addressed by `(flow version id, schema version)`. Backups are
/// written once and never modified, so a later migration or an operator can always go
/// back to the exact shape the document had at that version.

use crate::flow::{decode_json, FlowVersion};
use crate::storage::{FileMetadata, FileStore, FileType};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshots held in memory, keyed by (flow version id, schema version)
type StagedBackups = Arc<RwLock<HashMap<(String, String), FlowVersion>>>;

/// Backup store on top of a file collaborator
#[derive(Clone)]
pub struct BackupService {
    files: Arc<dyn FileStore>,
    staged: Option<StagedBackups>,
}

impl BackupService {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files, staged: None }
    }

    /// Backup service that never writes
    ///
    /// New snapshots are kept in memory for the lifetime of this service and served back
    /// by `get`; snapshots already in the file store are read as usual.
    pub fn read_only(files: Arc<dyn FileStore>) -> Self {
        Self {
            files,
            staged: Some(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// Snapshot a flow version under its current schema version
    ///
    /// Returns the file id of the snapshot. If a snapshot already exists for that version
    /// its id is returned and nothing is written. A read-only service returns `None` for
    /// snapshots it only holds in memory.
    pub async fn store(&self, flow_version: &FlowVersion) -> Result<Option<String>> {
        let schema_version = flow_version.schema_version.as_deref().with_context(|| {
            format!(
                "Flow version {} has no schema version to back up under",
                flow_version.id
            )
        })?;

        if let Some(existing) = self.files.find_backup(&flow_version.id, schema_version).await? {
            tracing::debug!(
                "📦 Backup of flow version {} at schema {} already exists: {}",
                flow_version.id,
                schema_version,
                existing
            );
            return Ok(Some(existing));
        }

        if let Some(staged) = &self.staged {
            staged
                .write()
                .await
                .entry((flow_version.id.clone(), schema_version.to_string()))
                .or_insert_with(|| flow_version.clone());
            return Ok(None);
        }

        let data = serde_json::to_vec(flow_version)?;
        let metadata = FileMetadata {
            file_type: FileType::FlowVersionBackup,
            flow_version_id: Some(flow_version.id.clone()),
            schema_version: Some(schema_version.to_string()),
        };

        let file_id = match self.files.save(data, metadata).await {
            Ok(file_id) => file_id,
            Err(e) => {
                // Another writer may have stored the same snapshot since the lookup
                match self.files.find_backup(&flow_version.id, schema_version).await? {
                    Some(existing) => {
                        tracing::debug!(
                            "📦 Backup of flow version {} at schema {} was stored concurrently: {}",
                            flow_version.id,
                            schema_version,
                            existing
                        );
                        return Ok(Some(existing));
                    }
                    None => return Err(e),
                }
            }
        };

        tracing::info!(
            "📦 Backed up flow version {} at schema {} as {}",
            flow_version.id,
            schema_version,
            file_id
        );

        Ok(Some(file_id))
    }

    /// The snapshot taken for a flow version at a schema version, if one was ever stored
    pub async fn get(
        &self,
        flow_version_id: &str,
        schema_version: &str,
    ) -> Result<Option<FlowVersion>> {
        if let Some(staged) = &self.staged {
            let key = (flow_version_id.to_string(), schema_version.to_string());
            if let Some(snapshot) = staged.read().await.get(&key) {
                return Ok(Some(snapshot.clone()));
            }
        }

        let Some(file_id) = self.files.find_backup(flow_version_id, schema_version).await? else {
            return Ok(None);
        };

        let data = self.files.get_data_or_throw(&file_id).await?;
        let json = std::str::from_utf8(&data)
            .with_context(|| format!("Backup {} is not valid UTF-8", file_id))?;
        let flow_version =
            decode_json(json).with_context(|| format!("Failed to decode backup {}", file_id))?;

        Ok(Some(flow_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::connect_in_memory;
    use crate::storage::memory::MemoryFileStore;
    use crate::storage::SqliteFileStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// File store whose first backup lookup misses, like a writer that lost a race
    struct LateLookupFileStore {
        inner: SqliteFileStore,
        missed: AtomicBool,
    }

    #[async_trait]
    impl FileStore for LateLookupFileStore {
        async fn save(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<String> {
            self.inner.save(data, metadata).await
        }

        async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get_data(id).await
        }

        async fn find_backup(
            &self,
            flow_version_id: &str,
            schema_version: &str,
        ) -> Result<Option<String>> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_backup(flow_version_id, schema_version).await
        }
    }

    fn router_flow_version() -> FlowVersion {
        serde_json::from_value(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "7",
            "trigger": {
                "name": "trigger",
                "type": "WEBHOOK",
                "displayName": "Catch webhook",
                "settings": { "inputUiInfo": {} },
                "nextAction": {
                    "name": "step_1",
                    "type": "ROUTER",
                    "displayName": "Router",
                    "settings": {
                        "branches": [
                            { "branchName": "A", "branchType": "CONDITION", "conditions": [[{ "firstValue": "1" }]] },
                            { "branchName": "Otherwise", "branchType": "FALLBACK" }
                        ],
                        "executionType": "EXECUTE_FIRST_MATCH"
                    },
                    "children": [
                        null,
                        { "name": "step_2", "type": "CODE", "settings": { "input": { "x": 1.5 } } }
                    ]
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_then_get_returns_identical_document() {
        let files = Arc::new(MemoryFileStore::new());
        let backups = BackupService::new(files.clone());
        let original = router_flow_version();

        backups.store(&original).await.unwrap();
        let restored = backups.get("fv1", "7").await.unwrap();

        assert_eq!(restored, Some(original));
    }

    #[tokio::test]
    async fn test_backups_are_created_once() {
        let files = Arc::new(MemoryFileStore::new());
        let backups = BackupService::new(files.clone());
        let original = router_flow_version();

        let first = backups.store(&original).await.unwrap();
        let mut changed = original.clone();
        changed.display_name = "changed".to_string();
        let second = backups.store(&changed).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(files.count(FileType::FlowVersionBackup).await, 1);
        assert_eq!(backups.get("fv1", "7").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_missing_backup_is_none() {
        let backups = BackupService::new(Arc::new(MemoryFileStore::new()));
        assert_eq!(backups.get("fv1", "7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unstamped_document_cannot_be_backed_up() {
        let backups = BackupService::new(Arc::new(MemoryFileStore::new()));
        let mut flow_version = router_flow_version();
        flow_version.schema_version = None;
        assert!(backups.store(&flow_version).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_store_returns_existing_backup() {
        let inner = SqliteFileStore::new(connect_in_memory().await.unwrap());
        let original = router_flow_version();
        let winner = BackupService::new(Arc::new(inner.clone()))
            .store(&original)
            .await
            .unwrap();

        let files = Arc::new(LateLookupFileStore {
            inner: inner.clone(),
            missed: AtomicBool::new(false),
        });
        let loser = BackupService::new(files).store(&original).await.unwrap();

        assert_eq!(loser, winner);
        assert_eq!(
            BackupService::new(Arc::new(inner)).get("fv1", "7").await.unwrap(),
            Some(original)
        );
    }

    #[tokio::test]
    async fn test_read_only_service_keeps_snapshots_in_memory() {
        let files = Arc::new(MemoryFileStore::new());
        let backups = BackupService::read_only(files.clone());
        let original = router_flow_version();

        assert_eq!(backups.store(&original).await.unwrap(), None);
        assert_eq!(backups.get("fv1", "7").await.unwrap(), Some(original.clone()));
        assert_eq!(files.count(FileType::FlowVersionBackup).await, 0);

        // Persisted snapshots are still visible and win over staged ones
        let stored = BackupService::new(files.clone()).store(&original).await.unwrap();
        let fresh = BackupService::read_only(files.clone());
        assert_eq!(fresh.store(&original).await.unwrap(), stored);
        assert_eq!(files.count(FileType::FlowVersionBackup).await, 1);
    }
}
