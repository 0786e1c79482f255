use crate::error::AppError;
use crate::feed::endpoint::{connect_price_stream, PriceWsStream};
use crate::feed::types::{
    parse_quote_payload, FeedConfig, FeedConnectionState, FeedEvent, FeedPayload,
    FeedStatusSnapshot,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct FeedShared {
    connected: AtomicBool,
    loading: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_error: parking_lot::Mutex<Option<String>>,
}

/// Owner-facing handle to a running price feed connection.
#[derive(Debug, Clone)]
pub struct PriceFeedHandle {
    shared: Arc<FeedShared>,
    outbound: mpsc::UnboundedSender<String>,
    cancel_token: CancellationToken,
}

impl PriceFeedHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Transmits only while the connection is open; otherwise the payload is
    /// dropped with a diagnostic warning and the caller gets no error signal.
    pub fn send_text(&self, payload: impl Into<String>) {
        if !self.is_connected() {
            tracing::warn!("price feed is not connected; dropping outbound message");
            return;
        }
        if self.outbound.send(payload.into()).is_err() {
            tracing::warn!("price feed task is gone; dropping outbound message");
        }
    }

    /// Serializes a structured payload before transmitting it.
    pub fn send_json<T: serde::Serialize>(&self, payload: &T) -> Result<(), AppError> {
        let text = simd_json::serde::to_string(payload)?;
        self.send_text(text);
        Ok(())
    }

    /// Disables future reconnection, cancels a pending reconnect timer and
    /// closes the live connection. Idempotent.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    /// Handle with no actor behind it; outbound messages are dropped.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (outbound, _) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(FeedShared::default()),
            outbound,
            cancel_token: CancellationToken::new(),
        }
    }
}

/// Spawns the connection actor. Lifecycle events arrive on `events`; the
/// latest state is mirrored into `status_store` on every transition.
pub fn start(
    config: FeedConfig,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    events: mpsc::UnboundedSender<FeedEvent>,
    cancel_token: CancellationToken,
) -> (PriceFeedHandle, JoinHandle<()>) {
    let shared = Arc::new(FeedShared::default());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let handle = PriceFeedHandle {
        shared: Arc::clone(&shared),
        outbound: outbound_tx.clone(),
        cancel_token: cancel_token.clone(),
    };
    let join_handle = tokio::spawn(run_price_feed(
        config,
        shared,
        outbound_tx,
        outbound_rx,
        status_store,
        events,
        cancel_token,
    ));

    (handle, join_handle)
}

#[allow(clippy::too_many_arguments)]
async fn run_price_feed(
    config: FeedConfig,
    shared: Arc<FeedShared>,
    // Keeps the outbound channel open even if every external handle is gone.
    _outbound_keepalive: mpsc::UnboundedSender<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    events: mpsc::UnboundedSender<FeedEvent>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempts = 0_u32;

    while !cancel_token.is_cancelled() {
        let phase = if reconnect_attempts == 0 {
            FeedConnectionState::Connecting
        } else {
            FeedConnectionState::Reconnecting
        };
        let reason = if reconnect_attempts == 0 {
            "opening websocket stream".to_string()
        } else {
            format!("reconnect attempt {reconnect_attempts}")
        };
        shared.loading.store(true, Ordering::Relaxed);
        publish_status(&status_store, &shared, &config.symbols, phase, Some(reason)).await;

        match connect_price_stream(&config.endpoint_url).await {
            Ok(mut stream) => {
                reconnect_attempts = 0;
                shared.reconnect_attempts.store(0, Ordering::Relaxed);
                shared.connected.store(true, Ordering::Relaxed);
                shared.loading.store(false, Ordering::Relaxed);
                *shared.last_error.lock() = None;
                publish_status(
                    &status_store,
                    &shared,
                    &config.symbols,
                    FeedConnectionState::Open,
                    Some("websocket connected".to_string()),
                )
                .await;
                let _ = events.send(FeedEvent::Opened);

                run_connected(&mut stream, &mut outbound, &shared, &events, &cancel_token).await;

                shared.connected.store(false, Ordering::Relaxed);
                let _ = events.send(FeedEvent::Closed);

                if cancel_token.is_cancelled() {
                    break;
                }
            }
            Err(error) => {
                shared.loading.store(false, Ordering::Relaxed);
                record_error(
                    &shared,
                    &events,
                    format!("websocket connect error: {error}"),
                );
            }
        }

        if !config.reconnect.allows(reconnect_attempts) {
            let reason = if config.reconnect.enabled {
                tracing::warn!(
                    attempts = reconnect_attempts,
                    "reconnect attempts exhausted"
                );
                "reconnect attempts exhausted"
            } else {
                "reconnect disabled"
            };
            publish_status(
                &status_store,
                &shared,
                &config.symbols,
                FeedConnectionState::Closed,
                Some(reason.to_string()),
            )
            .await;
            return;
        }

        reconnect_attempts += 1;
        shared
            .reconnect_attempts
            .store(reconnect_attempts, Ordering::Relaxed);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect.interval) => {}
        }
    }

    shared.connected.store(false, Ordering::Relaxed);
    shared.loading.store(false, Ordering::Relaxed);
    publish_status(
        &status_store,
        &shared,
        &config.symbols,
        FeedConnectionState::Closed,
        Some("stream stopped".to_string()),
    )
    .await;
}

async fn run_connected(
    stream: &mut PriceWsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shared: &Arc<FeedShared>,
    events: &mpsc::UnboundedSender<FeedEvent>,
    cancel_token: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = stream.close(None).await;
                return;
            }
            maybe_outbound = outbound.recv() => {
                let Some(text) = maybe_outbound else { return };
                if let Err(error) = stream.send(Message::Text(text)).await {
                    record_error(shared, events, format!("websocket send error: {error}"));
                    return;
                }
            }
            maybe_frame = stream.next() => {
                let Some(frame) = maybe_frame else { return };
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = events.send(FeedEvent::Message(decode_payload(text.into_bytes())));
                    }
                    Ok(Message::Binary(bytes)) => {
                        let _ = events.send(FeedEvent::Message(decode_payload(bytes)));
                    }
                    Ok(Message::Close(_)) => return,
                    Ok(_) => {}
                    Err(error) => {
                        record_error(shared, events, format!("websocket frame error: {error}"));
                        return;
                    }
                }
            }
        }
    }
}

/// Parses from a scratch copy so the original bytes survive a failed parse
/// and can be passed through uninterpreted.
fn decode_payload(bytes: Vec<u8>) -> FeedPayload {
    let mut scratch = bytes.clone();
    match parse_quote_payload(&mut scratch) {
        Ok(wire) => FeedPayload::Quote(wire),
        Err(_) => FeedPayload::Raw(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn record_error(
    shared: &Arc<FeedShared>,
    events: &mpsc::UnboundedSender<FeedEvent>,
    message: String,
) {
    tracing::warn!(error = %message, "price feed error");
    *shared.last_error.lock() = Some(message.clone());
    let _ = events.send(FeedEvent::Error(message));
}

async fn publish_status(
    status_store: &Arc<RwLock<FeedStatusSnapshot>>,
    shared: &Arc<FeedShared>,
    symbols: &[String],
    state: FeedConnectionState,
    reason: Option<String>,
) {
    let snapshot = FeedStatusSnapshot {
        state,
        symbols: symbols.to_vec(),
        reconnect_attempts: shared.reconnect_attempts.load(Ordering::Relaxed),
        last_error: shared.last_error.lock().clone(),
        reason,
    };

    let mut writable = status_store.write().await;
    *writable = snapshot;
}
