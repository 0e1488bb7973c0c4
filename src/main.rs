/// flowshift: schema-versioned migration engine for tree-structured flow versions
///
/// Main entry point. Migrates every stale flow version at startup, then serves:
/// - Migration runs at POST /api/migrations/run
/// - Upgraded reads at GET /api/flow-versions/{id}
/// - Backups at GET /api/flow-versions/{id}/backups/{schema_version}
/// - Health check at /healthz

use flowshift::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3005 and data/flowshift.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
