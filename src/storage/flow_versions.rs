/// Flow version persistence
///
/// The migration runner only needs id-keyed reads of whole documents and a narrow write
/// of the fields it owns. Documents are stored with the trigger tree as a JSON column.

use crate::flow::{decode_json, FlowVersion, SchemaVersion, Step};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::BTreeMap;

/// Fields written back after a flow version has been migrated
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerUpdate {
    pub schema_version: String,
    /// Rewritten step tree; `None` when no migration changed the tree
    pub trigger: Option<Step>,
    pub connection_ids: Vec<String>,
    pub backup_files: BTreeMap<String, String>,
}

/// Document store collaborator of the migration runner
#[async_trait]
pub trait FlowVersionStore: Send + Sync {
    /// Ids of flow versions with no schema version or one below `latest`
    async fn find_stale(&self, latest: SchemaVersion) -> Result<Vec<String>>;

    /// Load a flow version by id
    ///
    /// An undecodable document is an error whose chain contains a `serde_json::Error`.
    async fn load_by_id(&self, id: &str) -> Result<Option<FlowVersion>>;

    /// Persist the migrated fields of a flow version
    async fn save_trigger(&self, id: &str, update: &TriggerUpdate) -> Result<()>;
}

/// SQLite-based flow version storage
#[derive(Debug, Clone)]
pub struct SqliteFlowVersionStore {
    pool: SqlitePool,
}

impl SqliteFlowVersionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new flow version or replace an existing one
    ///
    /// Used when authoring and seeding; migrations go through `save_trigger`.
    pub async fn insert(&self, flow_version: &FlowVersion) -> Result<()> {
        let trigger_json = flow_version.trigger.as_ref().map(serde_json::to_string).transpose()?;
        let connection_ids = serde_json::to_string(&flow_version.connection_ids)?;
        let backup_files = serde_json::to_string(&flow_version.backup_files)?;

        sqlx::query(
            r#"
            INSERT INTO flow_versions (id, flow_id, display_name, schema_version, trigger, connection_ids, backup_files, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                flow_id = excluded.flow_id,
                display_name = excluded.display_name,
                schema_version = excluded.schema_version,
                trigger = excluded.trigger,
                connection_ids = excluded.connection_ids,
                backup_files = excluded.backup_files,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&flow_version.id)
        .bind(&flow_version.flow_id)
        .bind(&flow_version.display_name)
        .bind(&flow_version.schema_version)
        .bind(&trigger_json)
        .bind(&connection_ids)
        .bind(&backup_files)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FlowVersionStore for SqliteFlowVersionStore {
    async fn find_stale(&self, latest: SchemaVersion) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM flow_versions
            WHERE schema_version IS NULL OR CAST(schema_version AS INTEGER) < ?
            ORDER BY created_at, id
            "#,
        )
        .bind(i64::from(latest.get()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>("id")).collect())
    }

    async fn load_by_id(&self, id: &str) -> Result<Option<FlowVersion>> {
        let row = sqlx::query(
            r#"
            SELECT id, flow_id, display_name, schema_version, trigger, connection_ids, backup_files
            FROM flow_versions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let trigger_json: Option<String> = row.get("trigger");
        let connection_ids: String = row.get("connection_ids");
        let backup_files: String = row.get("backup_files");

        let trigger = trigger_json
            .as_deref()
            .map(decode_json::<Step>)
            .transpose()
            .with_context(|| format!("Failed to decode trigger of flow version {}", id))?;

        Ok(Some(FlowVersion {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            display_name: row.get("display_name"),
            trigger,
            schema_version: row.get("schema_version"),
            backup_files: serde_json::from_str(&backup_files)
                .with_context(|| format!("Failed to decode backup files of flow version {}", id))?,
            connection_ids: serde_json::from_str(&connection_ids)
                .with_context(|| {
                    format!("Failed to decode connection ids of flow version {}", id)
                })?,
        }))
    }

    async fn save_trigger(&self, id: &str, update: &TriggerUpdate) -> Result<()> {
        let connection_ids = serde_json::to_string(&update.connection_ids)?;
        let backup_files = serde_json::to_string(&update.backup_files)?;

        let result = match &update.trigger {
            Some(trigger) => {
                sqlx::query(
                    r#"
                    UPDATE flow_versions
                    SET schema_version = ?, trigger = ?, connection_ids = ?, backup_files = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                )
                .bind(&update.schema_version)
                .bind(serde_json::to_string(trigger)?)
                .bind(&connection_ids)
                .bind(&backup_files)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE flow_versions
                    SET schema_version = ?, connection_ids = ?, backup_files = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                )
                .bind(&update.schema_version)
                .bind(&connection_ids)
                .bind(&backup_files)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            anyhow::bail!("Flow version not found: {}", id);
        }

        Ok(())
    }
}
