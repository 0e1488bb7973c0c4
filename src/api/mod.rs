/// HTTP API Layer
///
/// Operator endpoints around the migration engine:
/// - Trigger a migration run and get its report
/// - Read flow versions upgraded to the latest schema
/// - Inspect backups taken before lossy migrations

// Operator endpoints
pub mod admin;

// Re-export router builder
pub use admin::{create_admin_routes, AdminState};
