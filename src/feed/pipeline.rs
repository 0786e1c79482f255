use crate::feed::connection::PriceFeedHandle;
use crate::feed::types::{subscribe_message, FeedConfig, FeedEvent, FeedPayload, QuoteWire, Tick};
use crate::history::PriceHistory;
use crate::worker::compute::{MarketStats, ProcessedStock, StockData};
use crate::worker::dispatcher::TaskDispatcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Updates pushed to the presentation layer. Results are keyed by symbol and
/// may complete out of order relative to tick arrival.
#[derive(Debug, Clone)]
pub enum DashboardUpdate {
    Quote(ProcessedStock),
    Stats(MarketStats),
}

/// Wires feed events into the history buffer, the per-symbol quote map and
/// the background worker, and publishes derived updates.
#[allow(clippy::too_many_arguments)]
pub async fn run_dashboard_pipeline(
    config: FeedConfig,
    feed: PriceFeedHandle,
    mut events: mpsc::UnboundedReceiver<FeedEvent>,
    history: Arc<Mutex<PriceHistory>>,
    quotes: Arc<RwLock<HashMap<String, Tick>>>,
    worker: TaskDispatcher,
    updates: broadcast::Sender<DashboardUpdate>,
    cancel_token: CancellationToken,
) {
    let stats_period = Duration::from_millis(config.stats_interval_ms);
    let mut stats_ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + stats_period, stats_period);
    stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = stats_ticker.tick() => {
                dispatch_stats(&quotes, &worker, &updates).await;
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                match event {
                    FeedEvent::Opened => subscribe(&feed, &config),
                    FeedEvent::Message(FeedPayload::Quote(wire)) => {
                        handle_quote(wire, &history, &quotes, &worker, &updates).await;
                    }
                    FeedEvent::Message(FeedPayload::Raw(payload)) => {
                        tracing::debug!(payload = %payload, "ignoring unstructured feed payload");
                    }
                    FeedEvent::Error(error) => {
                        tracing::warn!(error = %error, "price feed reported an error");
                    }
                    FeedEvent::Closed => {
                        tracing::info!("price feed disconnected");
                    }
                }
            }
        }
    }
}

fn subscribe(feed: &PriceFeedHandle, config: &FeedConfig) {
    match subscribe_message(&config.symbols) {
        Ok(message) => feed.send_text(message),
        Err(error) => tracing::warn!(error = %error, "failed to build subscribe message"),
    }
}

async fn handle_quote(
    wire: QuoteWire,
    history: &Arc<Mutex<PriceHistory>>,
    quotes: &Arc<RwLock<HashMap<String, Tick>>>,
    worker: &TaskDispatcher,
    updates: &broadcast::Sender<DashboardUpdate>,
) {
    if wire.is_control() {
        return;
    }
    let Some(tick) = wire.into_tick() else {
        return;
    };

    let last_price = {
        let mut writable = quotes.write().await;
        let previous = writable.get(&tick.symbol).map(|previous| previous.price);
        writable.insert(tick.symbol.clone(), tick.clone());
        previous
    };

    history
        .lock()
        .add_point(&tick.symbol, tick.price, now_unix_ms());

    let request = StockData {
        symbol: tick.symbol,
        price: tick.price,
        last_price,
        bid: tick.bid,
        ask: tick.ask,
        timestamp: tick.timestamp,
    };
    let worker = worker.clone();
    let updates = updates.clone();
    tokio::spawn(async move {
        match worker.process_stock(request).await {
            Ok(processed) => {
                let _ = updates.send(DashboardUpdate::Quote(processed));
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to process stock update");
            }
        }
    });
}

async fn dispatch_stats(
    quotes: &Arc<RwLock<HashMap<String, Tick>>>,
    worker: &TaskDispatcher,
    updates: &broadcast::Sender<DashboardUpdate>,
) {
    let snapshot: HashMap<String, StockData> = {
        let readable = quotes.read().await;
        readable
            .iter()
            .map(|(symbol, tick)| {
                (
                    symbol.clone(),
                    StockData {
                        symbol: tick.symbol.clone(),
                        price: tick.price,
                        last_price: None,
                        bid: tick.bid,
                        ask: tick.ask,
                        timestamp: tick.timestamp,
                    },
                )
            })
            .collect()
    };

    let worker = worker.clone();
    let updates = updates.clone();
    tokio::spawn(async move {
        match worker.calculate_stats(snapshot).await {
            Ok(stats) => {
                let _ = updates.send(DashboardUpdate::Stats(stats));
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to calculate market stats");
            }
        }
    });
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
