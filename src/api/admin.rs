/// Operator REST API endpoints
///
/// Lets an operator trigger a migration run, read flow versions the way the application
/// sees them (upgraded to the latest schema) and inspect backups for manual recovery.

use crate::{
    backup::BackupService,
    error::FailureKind,
    flow::FlowVersion,
    migration::{MigrationReport, MigrationRunner},
    storage::FlowVersionStore,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AdminState {
    /// Flow version documents
    pub store: Arc<dyn FlowVersionStore>,
    /// Pre-migration snapshots
    pub backups: BackupService,
    /// Migration runner shared with startup
    pub runner: MigrationRunner,
    /// Held for the duration of a run so runs never overlap
    pub run_lock: Arc<Mutex<()>>,
}

/// Create operator routes
pub fn create_admin_routes() -> Router<AdminState> {
    Router::new()
        .route("/api/migrations/run", post(run_migrations))
        .route("/api/flow-versions/{id}", get(get_flow_version))
        .route("/api/flow-versions/{id}/backups/{schema_version}", get(get_backup))
}

/// Run the migration chain over every stale flow version
///
/// POST /api/migrations/run
/// Returns: { "targetSchemaVersion": "12", "candidates": 3, "migrated": 3, "failures": [], ... }
async fn run_migrations(
    State(state): State<AdminState>,
) -> Result<Json<MigrationReport>, StatusCode> {
    let Ok(_guard) = state.run_lock.try_lock() else {
        tracing::warn!("⏳ Migration run requested while another run is in progress");
        return Err(StatusCode::CONFLICT);
    };

    match state.runner.migrate_all().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            tracing::error!("❌ Migration run failed to start: {:#}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Get a flow version, upgraded to the latest schema without writing it back
///
/// GET /api/flow-versions/{id}
async fn get_flow_version(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<FlowVersion>, StatusCode> {
    let flow_version = match state.store.load_by_id(&id).await {
        Ok(Some(flow_version)) => flow_version,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
            tracing::warn!("⚠️ Flow version {} is malformed: {:#}", id, e);
            return Err(StatusCode::UNPROCESSABLE_ENTITY);
        }
        Err(e) => {
            tracing::error!("Failed to get flow version {}: {:#}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match state.runner.upgrade(flow_version).await {
        Ok(upgraded) => Ok(Json(upgraded)),
        Err(e) => {
            tracing::warn!("⚠️ Failed to upgrade flow version {} on read: {}", id, e);
            Err(match e.kind() {
                FailureKind::MalformedInput | FailureKind::UnresolvedDependency => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                FailureKind::EngineDefect | FailureKind::Persistence => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            })
        }
    }
}

/// Get the snapshot a flow version had at a schema version
///
/// GET /api/flow-versions/{id}/backups/{schema_version}
async fn get_backup(
    State(state): State<AdminState>,
    Path((id, schema_version)): Path<(String, String)>,
) -> Result<Json<FlowVersion>, StatusCode> {
    match state.backups.get(&id, &schema_version).await {
        Ok(Some(backup)) => Ok(Json(backup)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(
                "Failed to get backup of flow version {} at schema {}: {:#}",
                id,
                schema_version,
                e
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
