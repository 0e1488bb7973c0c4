/// SQLite connection and schema setup
///
/// All collaborators of the migration engine (flow versions, files, piece metadata) live
/// in one SQLite database under the configured data directory.

use crate::config::DatabaseConfig;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Open (creating if needed) the flowshift database and initialize its schema
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let data_dir = Path::new(&config.data_dir);
    std::fs::create_dir_all(data_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir.display(), e)
    })?;
    let db_path = data_dir.join(&config.database_file);

    tracing::info!("🗄️ Opening database: {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    tracing::info!("✅ Database ready: {}", db_path.display());

    Ok(pool)
}

/// Private in-memory database with the full schema, for tests and dry runs
///
/// Every connection to `sqlite::memory:` sees its own database, so the pool is capped at one.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes
///
/// Safe to call multiple times (uses IF NOT EXISTS).
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flow_versions (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            display_name TEXT NOT NULL DEFAULT '',
            schema_version TEXT,
            trigger JSON,
            connection_ids JSON NOT NULL DEFAULT '[]',
            backup_files JSON NOT NULL DEFAULT '{}',
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            file_type TEXT NOT NULL,
            flow_version_id TEXT,
            schema_version TEXT,
            size INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS piece_metadata (
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_flow_versions_flow_id ON flow_versions(flow_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_flow_versions_schema_version ON flow_versions(schema_version)",
    )
    .execute(pool)
    .await?;

    // One backup per flow version and schema version
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_files_backup
        ON files(flow_version_id, schema_version)
        WHERE file_type = 'FLOW_VERSION_BACKUP'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
