use crate::error::AppError;
use crate::feed::connection;
use crate::feed::pipeline::run_dashboard_pipeline;
use crate::feed::types::{
    FeedConnectionState, FeedSession, FeedSettings, FeedStatusSnapshot, FeedStopResult,
    StartFeedArgs,
};
use crate::history::PriceHistory;
use crate::state::{DashboardState, FeedTaskHandle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Starts (or restarts) the price feed and its processing pipeline.
pub async fn start_price_feed(
    state: &DashboardState,
    settings: &FeedSettings,
    args: Option<StartFeedArgs>,
) -> Result<FeedSession, AppError> {
    let config = args.unwrap_or_default().normalize(settings)?;

    let existing_handle = {
        let mut feed_slot = state.feed.lock().await;
        feed_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.feed_join_handle.await;
        let _ = handle.pipeline_join_handle.await;
    }

    {
        let mut history = state.history.lock();
        *history = PriceHistory::new(
            config.history_interval_ms as i64,
            config.history_max_points,
        );
    }
    state.quotes.write().await.clear();

    let cancellation_token = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (connection_handle, feed_join_handle) = connection::start(
        config.clone(),
        Arc::clone(&state.feed_status),
        events_tx,
        cancellation_token.clone(),
    );
    let pipeline_join_handle = tokio::spawn(run_dashboard_pipeline(
        config.clone(),
        connection_handle.clone(),
        events_rx,
        Arc::clone(&state.history),
        Arc::clone(&state.quotes),
        state.worker.clone(),
        state.updates.clone(),
        cancellation_token.clone(),
    ));

    {
        let mut feed_slot = state.feed.lock().await;
        *feed_slot = Some(FeedTaskHandle {
            connection: connection_handle,
            cancellation_token,
            feed_join_handle,
            pipeline_join_handle,
        });
    }

    Ok(FeedSession::from_config(&config))
}

pub async fn stop_price_feed(state: &DashboardState) -> Result<FeedStopResult, AppError> {
    let existing_handle = {
        let mut feed_slot = state.feed.lock().await;
        feed_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.feed_join_handle.await;
        let _ = handle.pipeline_join_handle.await;
        true
    } else {
        false
    };

    {
        let current_symbols = {
            let readable = state.feed_status.read().await;
            readable.symbols.clone()
        };
        let mut writable = state.feed_status.write().await;
        *writable = FeedStatusSnapshot::closed(
            current_symbols,
            Some("feed stopped by command".to_string()),
        );
    }

    Ok(FeedStopResult { stopped })
}

pub async fn feed_status(state: &DashboardState) -> FeedStatusSnapshot {
    state.feed_status.read().await.clone()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub worker: &'static str,
    pub feed: FeedConnectionState,
}

pub async fn health(state: &DashboardState) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: state.started_at.elapsed().as_millis(),
        worker: if state.worker.is_available() {
            "ok"
        } else {
            "stopped"
        },
        feed: state.feed_status.read().await.state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::pipeline::DashboardUpdate;
    use crate::worker::compute::StockData;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[tokio::test]
    async fn full_feed_lifecycle_processes_quotes() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept should succeed");
            let mut ws = tokio_tungstenite::accept_async(socket)
                .await
                .expect("server handshake should succeed");

            let subscribe = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("expected subscribe message, got {other:?}"),
                }
            };
            assert!(subscribe.contains(r#""action":"subscribe""#));
            assert!(subscribe.contains("BTC/USD"));

            ws.send(Message::Text(
                r#"{"event":"subscribe","status":"ok"}"#.to_string(),
            ))
            .await
            .expect("server should send subscribe ack");
            ws.send(Message::Text(
                r#"{"symbol":"BTC/USD","price":42000.0}"#.to_string(),
            ))
            .await
            .expect("server should send first quote");
            ws.send(Message::Text(
                r#"{"symbol":"BTC/USD","last":42100.0}"#.to_string(),
            ))
            .await
            .expect("server should send second quote");

            // Hold the connection open until the client disconnects.
            while ws.next().await.is_some() {}
        });

        let state = DashboardState::new();
        let mut updates = state.subscribe_updates();
        let settings = FeedSettings {
            base_url: format!("ws://{addr}"),
            api_key: "test-key".to_string(),
        };

        let session = start_price_feed(
            &state,
            &settings,
            Some(StartFeedArgs {
                symbols: Some(vec!["BTC/USD".to_string()]),
                ..StartFeedArgs::default()
            }),
        )
        .await
        .expect("feed should start");
        assert!(session.running);
        assert_eq!(session.symbols, vec!["BTC/USD"]);

        let mut processed = Vec::new();
        while processed.len() < 2 {
            let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("timed out waiting for dashboard update")
                .expect("update channel should stay open");
            if let DashboardUpdate::Quote(quote) = update {
                processed.push(quote);
            }
        }
        processed.sort_by(|a, b| a.price.total_cmp(&b.price));
        assert_eq!(processed[0].price, 42000.0);
        assert_eq!(processed[1].price, 42100.0);
        assert_eq!(processed[1].last_price, Some(42000.0));
        assert_eq!(processed[1].change, 100.0);

        let status = feed_status(&state).await;
        assert_eq!(status.state, FeedConnectionState::Open);
        {
            let history = state.history.lock();
            assert!(!history.points().is_empty());
        }

        let stop = stop_price_feed(&state).await.expect("stop should succeed");
        assert!(stop.stopped);

        // Closing the connection does not disturb the worker context.
        let after_close = state
            .worker
            .process_stock(StockData {
                symbol: "AAPL".to_string(),
                price: 10.0,
                last_price: Some(5.0),
                bid: None,
                ask: None,
                timestamp: None,
            })
            .await
            .expect("worker should survive feed shutdown");
        assert_eq!(after_close.change, 5.0);

        let status = feed_status(&state).await;
        assert_eq!(status.state, FeedConnectionState::Closed);
        assert_eq!(status.reason.as_deref(), Some("feed stopped by command"));

        let second_stop = stop_price_feed(&state).await.expect("stop should succeed");
        assert!(!second_stop.stopped);

        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }

    #[tokio::test]
    async fn restart_replaces_running_feed() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                        return;
                    };
                    while ws.next().await.is_some() {}
                });
            }
        });

        let state = DashboardState::new();
        let settings = FeedSettings {
            base_url: format!("ws://{addr}"),
            api_key: "test-key".to_string(),
        };

        start_price_feed(&state, &settings, None)
            .await
            .expect("first start should succeed");
        let session = start_price_feed(
            &state,
            &settings,
            Some(StartFeedArgs {
                symbols: Some(vec!["AAPL".to_string()]),
                ..StartFeedArgs::default()
            }),
        )
        .await
        .expect("restart should succeed");

        assert_eq!(session.symbols, vec!["AAPL"]);
        {
            let feed_slot = state.feed.lock().await;
            assert!(feed_slot.is_some());
        }

        stop_price_feed(&state).await.expect("stop should succeed");
    }

    #[tokio::test]
    async fn health_reports_worker_and_feed_state() {
        let state = DashboardState::new();

        let response = health(&state).await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.worker, "ok");
        assert_eq!(response.feed, FeedConnectionState::Closed);

        state.worker.shutdown();
        let degraded = health(&state).await;
        assert_eq!(degraded.worker, "stopped");
    }
}
