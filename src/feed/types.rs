use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SYMBOLS: &[&str] = &[
    "AAPL", "TRP", "QQQ", "EUR/USD", "USD/JPY", "BTC/USD", "ETH/BTC",
];
pub const DEFAULT_RECONNECT_ENABLED: bool = true;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 5_000;
pub const MIN_RECONNECT_INTERVAL_MS: u64 = 100;
pub const MAX_RECONNECT_INTERVAL_MS: u64 = 60_000;
pub const MAX_RECONNECT_ATTEMPTS_LIMIT: u32 = 100;
pub const MIN_HISTORY_INTERVAL_MS: u64 = 100;
pub const MAX_HISTORY_INTERVAL_MS: u64 = 60_000;
pub const MIN_HISTORY_POINTS: usize = 10;
pub const MAX_HISTORY_POINTS: usize = 10_000;
pub const MIN_STATS_INTERVAL_MS: u64 = 500;
pub const MAX_STATS_INTERVAL_MS: u64 = 300_000;

pub const FEED_BASE_URL_ENV: &str = "FEED_BASE_URL";
pub const FEED_API_KEY_ENV: &str = "FEED_API_KEY";

/// Build-time/environment feed credentials.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub base_url: String,
    pub api_key: String,
}

impl FeedSettings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(
            std::env::var(FEED_BASE_URL_ENV).ok(),
            std::env::var(FEED_API_KEY_ENV).ok(),
        )
    }

    pub fn from_vars(
        base_url: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, AppError> {
        let base_url = base_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("{FEED_BASE_URL_ENV} must be set"))
            })?;
        let api_key = api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("{FEED_API_KEY_ENV} must be set"))
            })?;

        Ok(Self { base_url, api_key })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub symbols: Vec<String>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn closed(symbols: Vec<String>, reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Closed,
            symbols,
            reconnect_attempts: 0,
            last_error: None,
            reason,
        }
    }
}

/// Fixed-interval reconnection policy. Attempts reset on every successful
/// open; once the cap is reached no further reconnect is scheduled.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_RECONNECT_ENABLED,
            interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub symbols: Option<Vec<String>>,
    pub reconnect: Option<bool>,
    pub reconnect_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub history_interval_ms: Option<u64>,
    pub history_max_points: Option<usize>,
    pub stats_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint_url: String,
    pub symbols: Vec<String>,
    pub reconnect: ReconnectPolicy,
    pub history_interval_ms: u64,
    pub history_max_points: usize,
    pub stats_interval_ms: u64,
}

impl StartFeedArgs {
    pub fn normalize(self, settings: &FeedSettings) -> Result<FeedConfig, AppError> {
        let raw_symbols = self
            .symbols
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());
        if raw_symbols.is_empty() {
            return Err(AppError::InvalidArgument(
                "symbols must not be empty".to_string(),
            ));
        }

        let mut symbols = Vec::with_capacity(raw_symbols.len());
        for raw in raw_symbols {
            let symbol = raw.trim().to_ascii_uppercase();
            let valid = !symbol.is_empty()
                && symbol
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '-'));
            if !valid {
                return Err(AppError::InvalidArgument(format!(
                    "symbol '{raw}' must be non-empty alphanumeric ASCII (plus '/', '.', '-')"
                )));
            }
            symbols.push(symbol);
        }

        let reconnect_enabled = self.reconnect.unwrap_or(DEFAULT_RECONNECT_ENABLED);
        let reconnect_interval_ms = self
            .reconnect_interval_ms
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS);
        if !(MIN_RECONNECT_INTERVAL_MS..=MAX_RECONNECT_INTERVAL_MS)
            .contains(&reconnect_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnectIntervalMs must be between {MIN_RECONNECT_INTERVAL_MS} and {MAX_RECONNECT_INTERVAL_MS}"
            )));
        }
        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS_LIMIT {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS_LIMIT}"
            )));
        }

        let history_interval_ms = self
            .history_interval_ms
            .unwrap_or(crate::history::DEFAULT_HISTORY_INTERVAL_MS as u64);
        if !(MIN_HISTORY_INTERVAL_MS..=MAX_HISTORY_INTERVAL_MS).contains(&history_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "historyIntervalMs must be between {MIN_HISTORY_INTERVAL_MS} and {MAX_HISTORY_INTERVAL_MS}"
            )));
        }
        let history_max_points = self
            .history_max_points
            .unwrap_or(crate::history::DEFAULT_MAX_HISTORY_POINTS);
        if !(MIN_HISTORY_POINTS..=MAX_HISTORY_POINTS).contains(&history_max_points) {
            return Err(AppError::InvalidArgument(format!(
                "historyMaxPoints must be between {MIN_HISTORY_POINTS} and {MAX_HISTORY_POINTS}"
            )));
        }
        let stats_interval_ms = self.stats_interval_ms.unwrap_or(DEFAULT_STATS_INTERVAL_MS);
        if !(MIN_STATS_INTERVAL_MS..=MAX_STATS_INTERVAL_MS).contains(&stats_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "statsIntervalMs must be between {MIN_STATS_INTERVAL_MS} and {MAX_STATS_INTERVAL_MS}"
            )));
        }

        Ok(FeedConfig {
            endpoint_url: crate::feed::endpoint::ws_endpoint(settings),
            symbols,
            reconnect: ReconnectPolicy {
                enabled: reconnect_enabled,
                interval: Duration::from_millis(reconnect_interval_ms),
                max_attempts: max_reconnect_attempts,
            },
            history_interval_ms,
            history_max_points,
            stats_interval_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub running: bool,
    pub symbols: Vec<String>,
    pub reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub history_interval_ms: u64,
    pub history_max_points: usize,
    pub stats_interval_ms: u64,
}

impl FeedSession {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            running: true,
            symbols: config.symbols.clone(),
            reconnect: config.reconnect.enabled,
            reconnect_interval_ms: config.reconnect.interval.as_millis() as u64,
            max_reconnect_attempts: config.reconnect.max_attempts,
            history_interval_ms: config.history_interval_ms,
            history_max_points: config.history_max_points,
            stats_interval_ms: config.stats_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStopResult {
    pub stopped: bool,
}

/// One structured message from the remote feed. Quote payloads carry at
/// least `symbol` and `price` (or `last`); control acknowledgements carry
/// `event`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteWire {
    pub event: Option<String>,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
}

impl QuoteWire {
    pub fn is_control(&self) -> bool {
        self.event.as_deref() == Some("subscribe")
    }

    /// Quote payloads without a symbol or a finite price never become ticks.
    pub fn into_tick(self) -> Option<Tick> {
        let symbol = self.symbol?;
        let price = self.price.or(self.last)?;
        if !price.is_finite() {
            return None;
        }

        Some(Tick {
            symbol,
            price,
            bid: self.bid,
            ask: self.ask,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<i64>,
}

pub fn parse_quote_payload(payload: &mut [u8]) -> Result<QuoteWire, AppError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

#[derive(Debug, Serialize)]
struct SubscribeParams {
    symbols: String,
}

#[derive(Debug, Serialize)]
struct SubscribeAction {
    action: &'static str,
    params: SubscribeParams,
}

/// Control message sent after every successful open.
pub fn subscribe_message(symbols: &[String]) -> Result<String, AppError> {
    let message = SubscribeAction {
        action: "subscribe",
        params: SubscribeParams {
            symbols: symbols.join(","),
        },
    };
    Ok(simd_json::serde::to_string(&message)?)
}

/// Connection lifecycle events delivered to the owner as tagged variants
/// over a single channel.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Opened,
    Message(FeedPayload),
    Error(String),
    Closed,
}

#[derive(Debug, Clone)]
pub enum FeedPayload {
    Quote(QuoteWire),
    /// Payloads that fail structured parsing are passed through unchanged.
    Raw(String),
}
