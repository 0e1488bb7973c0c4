/// Storage Layer
///
/// Collaborators of the migration engine, each behind a trait so the runner can be driven
/// against SQLite in production and in-memory maps in tests:
/// - Flow version documents (`FlowVersionStore`)
/// - Blob files for code artifacts and backups (`FileStore`)
/// - Piece reference data (`PieceVersionSource`)

// SQLite connection pool and schema
pub mod database;

// Flow version documents
pub mod flow_versions;

// Artifact and backup blobs
pub mod files;

// Latest piece versions (SQLite table or remote registry)
pub mod pieces;

// In-memory implementations of every collaborator
pub mod memory;

pub use files::{FileMetadata, FileStore, FileType, SqliteFileStore};
pub use flow_versions::{FlowVersionStore, SqliteFlowVersionStore, TriggerUpdate};
pub use pieces::{HttpPieceVersionSource, PieceVersionSource, SqlitePieceVersionSource};
