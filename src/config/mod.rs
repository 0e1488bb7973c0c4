/// Configuration management for the flowshift service
///
/// Handles server configuration, the SQLite database location, migration runner tuning
/// and where piece reference data comes from.

use crate::migration::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Migration runner configuration
    pub migration: MigrationConfig,
    /// Piece reference data configuration
    pub pieces: PiecesConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database file (default: "data")
    pub data_dir: String,
    /// Database file name inside `data_dir`
    pub database_file: String,
    pub max_connections: u32,
}

/// Migration runner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Flow versions loaded per batch
    pub batch_size: usize,
    /// Flow versions migrated at the same time
    pub concurrency: usize,
    /// Timeout for each storage call, in seconds
    pub io_timeout_secs: u64,
}

impl MigrationConfig {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
        }
    }
}

/// Where the latest piece versions are read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiecesConfig {
    /// Remote registry endpoint; the local `piece_metadata` table is used when unset
    pub registry_url: Option<String>,
}

/// Read and parse an env var, falling back to `default` when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWSHIFT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWSHIFT_PORT", 3005),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWSHIFT_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
                database_file: "flowshift.db".to_string(),
                max_connections: 5,
            },
            migration: MigrationConfig {
                batch_size: env_or("FLOWSHIFT_MIGRATION_BATCH_SIZE", 100),
                concurrency: env_or("FLOWSHIFT_MIGRATION_CONCURRENCY", 4),
                io_timeout_secs: env_or("FLOWSHIFT_IO_TIMEOUT_SECS", 30),
            },
            pieces: PiecesConfig {
                registry_url: std::env::var("FLOWSHIFT_PIECE_REGISTRY_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
        }
    }
}
