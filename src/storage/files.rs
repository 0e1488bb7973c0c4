/// Blob storage for code artifacts and flow version backups

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

/// What a stored file contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    /// Zipped source of a code step (`index.ts` + `package.json`)
    CodeArtifact,
    /// Full JSON snapshot of a flow version taken before a lossy migration
    FlowVersionBackup,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::CodeArtifact => "CODE_ARTIFACT",
            FileType::FlowVersionBackup => "FLOW_VERSION_BACKUP",
        }
    }
}

/// Metadata recorded next to a file's bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_type: FileType,
    pub flow_version_id: Option<String>,
    pub schema_version: Option<String>,
}

/// File collaborator: id-addressable blob storage
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store bytes and return the new file id
    async fn save(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<String>;

    /// Bytes of a file, `None` if no file has that id
    async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Bytes of a file that must exist
    async fn get_data_or_throw(&self, id: &str) -> Result<Vec<u8>> {
        self.get_data(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", id))
    }

    /// Id of the backup taken for a flow version at a schema version
    async fn find_backup(
        &self,
        flow_version_id: &str,
        schema_version: &str,
    ) -> Result<Option<String>>;
}

/// SQLite-based file storage (bytes kept in a BLOB column)
#[derive(Debug, Clone)]
pub struct SqliteFileStore {
    pool: SqlitePool,
}

impl SqliteFileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileStore for SqliteFileStore {
    async fn save(&self, data: Vec<u8>, metadata: FileMetadata) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO files (id, file_type, flow_version_id, schema_version, size, data)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(metadata.file_type.as_str())
        .bind(&metadata.flow_version_id)
        .bind(&metadata.schema_version)
        .bind(data.len() as i64)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "💾 Stored {} file {} ({} bytes)",
            metadata.file_type.as_str(),
            id,
            data.len()
        );

        Ok(id)
    }

    async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT data FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<Vec<u8>, _>("data")))
    }

    async fn find_backup(
        &self,
        flow_version_id: &str,
        schema_version: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM files
            WHERE file_type = ? AND flow_version_id = ? AND schema_version = ?
            "#,
        )
        .bind(FileType::FlowVersionBackup.as_str())
        .bind(flow_version_id)
        .bind(schema_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<String, _>("id")))
    }
}
