/// Server setup and initialization
///
/// Wires together all components: storage, reference data, the migration runner and HTTP
/// routes. Stale flow versions are migrated once at startup, before the router is served.

use crate::{
    api::{create_admin_routes, AdminState},
    backup::BackupService,
    config::Config,
    migration::{MigrationRegistry, MigrationRunner},
    storage::{
        database, FileStore, FlowVersionStore, HttpPieceVersionSource, PieceVersionSource,
        SqliteFileStore, SqliteFlowVersionStore, SqlitePieceVersionSource,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Opens the database, builds the migration runner and runs it once so every stored
/// flow version is at the latest schema before the first request is served.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("🗄️ Initializing storage in {}", config.database.data_dir);
    let pool = database::connect(&config.database).await?;

    let store: Arc<dyn FlowVersionStore> = Arc::new(SqliteFlowVersionStore::new(pool.clone()));
    let files: Arc<dyn FileStore> = Arc::new(SqliteFileStore::new(pool.clone()));

    let pieces: Arc<dyn PieceVersionSource> = match &config.pieces.registry_url {
        Some(url) => {
            tracing::info!("📚 Reading piece versions from registry: {}", url);
            Arc::new(HttpPieceVersionSource::new(
                url.clone(),
                Duration::from_secs(config.migration.io_timeout_secs),
            )?)
        }
        None => {
            tracing::info!("📚 Reading piece versions from local piece metadata");
            Arc::new(SqlitePieceVersionSource::new(pool.clone()))
        }
    };

    let registry = MigrationRegistry::standard();
    tracing::info!(
        "⚙️ Migration chain covers schema versions {} to {}",
        registry.baseline(),
        registry.latest()
    );
    let runner = MigrationRunner::new(
        store.clone(),
        files.clone(),
        pieces,
        registry,
        config.migration.runner_config(),
    );

    let run_lock = Arc::new(Mutex::new(()));
    {
        let _guard = run_lock.lock().await;
        let report = runner.migrate_all().await?;
        if report.failed() > 0 {
            tracing::warn!(
                "⚠️ Startup migration left {} flow versions behind, see errors above",
                report.failed()
            );
        }
    }

    let state = AdminState {
        store,
        backups: BackupService::new(files),
        runner,
        run_lock,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Operator API routes
        .merge(create_admin_routes().with_state(state));

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowshift server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
