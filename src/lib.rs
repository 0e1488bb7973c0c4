/// flowshift: schema-versioned migration engine for tree-structured flow versions
///
/// Flow versions store their steps as a tree rooted at the trigger. When the step schema
/// changes, stored documents are upgraded by an ordered chain of migrations, each moving
/// a document exactly one schema version forward.

// Core configuration and setup
pub mod config;

// Migration failure types
pub mod error;

// Flow model layer - step tree, flow version documents and the traversal engine
pub mod flow;

// Storage layer - document store, file store and piece reference data
pub mod storage;

// Pre-migration snapshots of flow versions
pub mod backup;

// Migration layer - migration chain and the batch runner
pub mod migration;

// HTTP API layer - operator endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{FailureKind, MigrationError};
pub use flow::{FlowVersion, SchemaVersion, Step, StepBody};
pub use migration::{MigrationRegistry, MigrationReport, MigrationRunner, RunnerConfig};
pub use server::start_server;
