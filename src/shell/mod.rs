pub mod store;

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::oneshot;

pub const DEFAULT_CACHE_NAME: &str = "stock-app-v1";
pub const DEFAULT_PRECACHE_ASSETS: &[&str] = &["/", "/index.html"];
pub const STATIC_ASSET_EXTENSIONS: &[&str] = &[".js", ".css", ".png", ".svg"];
pub const PROCESS_STOCK_DATA: &str = "PROCESS_STOCK_DATA";

/// Offline shell configuration. `cache_name` is the single invalidation
/// knob: bumping it strands the previous generation, which `activate`
/// deletes.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub cache_name: String,
    pub precache_assets: Vec<String>,
    pub base_url: String,
}

impl ShellConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            precache_assets: DEFAULT_PRECACHE_ASSETS
                .iter()
                .map(|asset| asset.to_string())
                .collect(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAsset {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub cached_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub method: String,
    pub url: String,
}

impl ShellRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShellStockRow {
    pub symbol: String,
    pub price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShellProcessedRow {
    pub symbol: String,
    pub price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
    pub price_formatted: String,
    pub change_percent: f64,
    pub timestamp_formatted: Option<String>,
}

/// Ad hoc compute envelope: `{kind, rows}` in, `{processed}` out on the
/// provided reply channel. Not correlation-tracked.
#[derive(Debug)]
pub struct ShellMessage {
    pub kind: String,
    pub rows: Vec<ShellStockRow>,
    pub reply: oneshot::Sender<ShellReply>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ShellReply {
    pub processed: Vec<ShellProcessedRow>,
}

/// Versioned, persistent asset cache serving the app shell cache-first with
/// network fallback.
pub struct OfflineShell {
    config: ShellConfig,
    pool: SqlitePool,
    client: reqwest::Client,
}

impl OfflineShell {
    pub fn new(pool: SqlitePool, config: ShellConfig) -> Self {
        Self {
            config,
            pool,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Best-effort pre-population of the shell asset list; individual
    /// failures are swallowed.
    pub async fn install(&self) {
        for asset in &self.config.precache_assets {
            match self.fetch_from_network(asset).await {
                Ok(Some(fetched)) => {
                    if let Err(error) =
                        store::put_cached_asset(&self.pool, &self.config.cache_name, &fetched)
                            .await
                    {
                        tracing::warn!(asset = %asset, error = %error, "failed to cache shell asset");
                    }
                }
                Ok(None) => {
                    tracing::warn!(asset = %asset, "shell asset skipped during install");
                }
                Err(error) => {
                    tracing::warn!(asset = %asset, error = %error, "shell asset could not be precached");
                }
            }
        }
    }

    /// Deletes every cache generation other than the configured one.
    pub async fn activate(&self) -> Result<u64, AppError> {
        let purged = store::purge_stale_caches(&self.pool, &self.config.cache_name).await?;
        if purged > 0 {
            tracing::info!(purged, cache = %self.config.cache_name, "purged stale shell caches");
        }
        Ok(purged)
    }

    /// Cache-first lookup with network fallback. Non-GET methods and
    /// websocket upgrade URLs are skipped; static assets fetched from the
    /// network are opportunistically written back; network failures degrade
    /// to `None`.
    pub async fn fetch(&self, request: &ShellRequest) -> Result<Option<CachedAsset>, AppError> {
        if !request.method.eq_ignore_ascii_case("GET") {
            return Ok(None);
        }
        if request.url.starts_with("ws://") || request.url.starts_with("wss://") {
            return Ok(None);
        }

        if let Some(cached) =
            store::get_cached_asset(&self.pool, &self.config.cache_name, &request.url).await?
        {
            return Ok(Some(cached));
        }

        match self.fetch_from_network(&request.url).await {
            Ok(Some(fetched)) => {
                if is_static_asset(&request.url) {
                    if let Err(error) =
                        store::put_cached_asset(&self.pool, &self.config.cache_name, &fetched)
                            .await
                    {
                        tracing::warn!(url = %request.url, error = %error, "failed to write asset back to cache");
                    }
                }
                Ok(Some(fetched))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                tracing::warn!(url = %request.url, error = %error, "fetch failed");
                Ok(None)
            }
        }
    }

    async fn fetch_from_network(&self, url: &str) -> Result<Option<CachedAsset>, AppError> {
        let target = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        };

        let response = self.client.get(&target).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response.bytes().await?.to_vec();

        Ok(Some(CachedAsset {
            url: url.to_string(),
            content_type,
            body,
            cached_at_ms: store::now_unix_ms(),
        }))
    }

    /// Ad hoc compute channel. Unknown kinds are ignored, dropping the reply
    /// sender.
    pub fn handle_message(&self, message: ShellMessage) {
        if message.kind != PROCESS_STOCK_DATA {
            tracing::debug!(kind = %message.kind, "ignoring unknown shell message");
            return;
        }

        let processed = process_stock_rows(message.rows);
        let _ = message.reply.send(ShellReply { processed });
    }
}

/// Matches on the file extension of the URL path; query and fragment are
/// excluded from the match.
pub fn is_static_asset(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    STATIC_ASSET_EXTENSIONS
        .iter()
        .any(|extension| path.ends_with(extension))
}

pub fn process_stock_rows(rows: Vec<ShellStockRow>) -> Vec<ShellProcessedRow> {
    rows.into_iter().map(process_stock_row).collect()
}

fn process_stock_row(row: ShellStockRow) -> ShellProcessedRow {
    let price_formatted = row
        .price
        .map(|price| format!("{price:.2}"))
        .unwrap_or_else(|| "N/A".to_string());

    let change_percent = match (row.bid, row.ask) {
        (Some(bid), Some(ask)) if bid != 0.0 => {
            let percent = (ask - bid) / bid * 100.0;
            (percent * 100.0).round() / 100.0
        }
        _ => 0.0,
    };

    let timestamp_formatted = row.timestamp.and_then(|seconds| {
        chrono::DateTime::from_timestamp(seconds, 0)
            .map(|moment| moment.format("%H:%M:%S").to_string())
    });

    ShellProcessedRow {
        symbol: row.symbol,
        price: row.price,
        bid: row.bid,
        ask: row.ask,
        timestamp: row.timestamp,
        price_formatted,
        change_percent,
        timestamp_formatted,
    }
}
