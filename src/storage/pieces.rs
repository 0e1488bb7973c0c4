/// Reference data: latest published version of every piece
///
/// Migrations that pin piece versions need a point-in-time snapshot of this map, loaded
/// once before any document is touched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{sqlite::SqlitePool, Row};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

/// Reference-data collaborator
#[async_trait]
pub trait PieceVersionSource: Send + Sync {
    /// Map of piece name to its latest published version
    async fn latest_versions_by_name(&self) -> Result<HashMap<String, String>>;
}

/// Piece metadata read from the local `piece_metadata` table
#[derive(Debug, Clone)]
pub struct SqlitePieceVersionSource {
    pool: SqlitePool,
}

impl SqlitePieceVersionSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a published piece version
    pub async fn publish(&self, name: &str, version: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO piece_metadata (name, version) VALUES (?, ?)")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PieceVersionSource for SqlitePieceVersionSource {
    async fn latest_versions_by_name(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT name, version FROM piece_metadata")
            .fetch_all(&self.pool)
            .await?;

        Ok(latest_by_name(
            rows.iter()
                .map(|row| (row.get::<String, _>("name"), row.get::<String, _>("version"))),
        ))
    }
}

/// Piece metadata fetched from a remote registry endpoint returning `[{ name, version }]`
#[derive(Debug, Clone)]
pub struct HttpPieceVersionSource {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PieceSummary {
    name: String,
    version: String,
}

impl HttpPieceVersionSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build piece registry client")?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl PieceVersionSource for HttpPieceVersionSource {
    async fn latest_versions_by_name(&self) -> Result<HashMap<String, String>> {
        tracing::debug!("🌐 Fetching piece versions from {}", self.url);

        let pieces: Vec<PieceSummary> = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to reach piece registry at {}", self.url))?
            .error_for_status()?
            .json()
            .await
            .context("Piece registry returned an unexpected payload")?;

        Ok(latest_by_name(pieces.into_iter().map(|p| (p.name, p.version))))
    }
}

/// Keep the highest version seen for every name
pub fn latest_by_name(
    pairs: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let mut latest: HashMap<String, String> = HashMap::new();
    for (name, version) in pairs {
        match latest.get(&name) {
            Some(current) if compare_versions(current, &version) != Ordering::Less => {}
            _ => {
                latest.insert(name, version);
            }
        }
    }
    latest
}

/// Compare dotted versions component by component
///
/// Numeric components compare as numbers, anything else (pre-release tags) as text; a
/// version with extra components sorts after its prefix.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.trim_start_matches(['~', '^', 'v']).split('.');
    let mut right = b.trim_start_matches(['~', '^', 'v']).split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::connect_in_memory;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("0.10.0", "0.9.7"), Ordering::Greater);
        assert_eq!(compare_versions("~0.3.1", "0.3.1"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_sqlite_source_returns_highest_version_per_piece() {
        let source = SqlitePieceVersionSource::new(connect_in_memory().await.unwrap());
        source.publish("@activepieces/piece-slack", "0.9.0").await.unwrap();
        source.publish("@activepieces/piece-slack", "0.10.1").await.unwrap();
        source.publish("@activepieces/piece-slack", "0.10.0").await.unwrap();
        source.publish("@activepieces/piece-http", "0.4.2").await.unwrap();

        let latest = source.latest_versions_by_name().await.unwrap();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest["@activepieces/piece-slack"], "0.10.1");
        assert_eq!(latest["@activepieces/piece-http"], "0.4.2");
    }

    #[tokio::test]
    async fn test_http_source_reads_registry_listing() {
        let app = axum::Router::new().route(
            "/v1/pieces",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!([
                    { "name": "@activepieces/piece-gmail", "version": "0.8.1", "displayName": "Gmail" },
                    { "name": "@activepieces/piece-gmail", "version": "0.9.0" },
                    { "name": "@activepieces/piece-slack", "version": "0.5.3" }
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let timeout = Duration::from_secs(5);
        let source =
            HttpPieceVersionSource::new(format!("http://{}/v1/pieces", addr), timeout).unwrap();
        let latest = source.latest_versions_by_name().await.unwrap();

        assert_eq!(latest["@activepieces/piece-gmail"], "0.9.0");
        assert_eq!(latest["@activepieces/piece-slack"], "0.5.3");

        let missing =
            HttpPieceVersionSource::new(format!("http://{}/nope", addr), timeout).unwrap();
        assert!(missing.latest_versions_by_name().await.is_err());
    }
}
