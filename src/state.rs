use crate::feed::connection::PriceFeedHandle;
use crate::feed::pipeline::DashboardUpdate;
use crate::feed::types::{FeedStatusSnapshot, Tick, DEFAULT_SYMBOLS};
use crate::history::PriceHistory;
use crate::worker::dispatcher::{TaskDispatcher, WorkerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub struct FeedTaskHandle {
    pub connection: PriceFeedHandle,
    pub cancellation_token: CancellationToken,
    pub feed_join_handle: JoinHandle<()>,
    pub pipeline_join_handle: JoinHandle<()>,
}

pub struct DashboardState {
    pub started_at: Instant,
    pub worker: TaskDispatcher,
    pub feed: Mutex<Option<FeedTaskHandle>>,
    pub feed_status: Arc<RwLock<FeedStatusSnapshot>>,
    pub quotes: Arc<RwLock<HashMap<String, Tick>>>,
    pub history: Arc<parking_lot::Mutex<PriceHistory>>,
    pub updates: broadcast::Sender<DashboardUpdate>,
}

impl DashboardState {
    /// Spawns the background worker context; must be created inside the
    /// tokio runtime.
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let feed_status = FeedStatusSnapshot::closed(
            DEFAULT_SYMBOLS.iter().map(|symbol| symbol.to_string()).collect(),
            Some("stream idle".to_string()),
        );

        Self {
            started_at: Instant::now(),
            worker: TaskDispatcher::spawn(WorkerConfig::default()),
            feed: Mutex::new(None),
            feed_status: Arc::new(RwLock::new(feed_status)),
            quotes: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(parking_lot::Mutex::new(PriceHistory::default())),
            updates,
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DashboardUpdate> {
        self.updates.subscribe()
    }
}

impl Default for DashboardState {
    fn default() -> Self {
        Self::new()
    }
}
