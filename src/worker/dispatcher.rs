use crate::worker::compute::{
    calculate_stats, process_stock, MarketStats, ProcessedStock, StockData,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("background worker is not running")]
    WorkerUnavailable,
    #[error("background worker stopped before responding")]
    WorkerStopped,
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown task type: {0}")]
    UnknownTask(String),
    #[error("task failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    ProcessStock(StockData),
    CalculateStats(HashMap<String, StockData>),
}

impl TaskRequest {
    pub const PROCESS_STOCK: &'static str = "PROCESS_STOCK";
    pub const CALCULATE_STATS: &'static str = "CALCULATE_STATS";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessStock(_) => Self::PROCESS_STOCK,
            Self::CalculateStats(_) => Self::CALCULATE_STATS,
        }
    }

    /// Parses an externally supplied `{type, data}` envelope. Unknown task
    /// types fail that call only.
    pub fn from_wire(kind: &str, payload: &mut [u8]) -> Result<Self, TaskError> {
        match kind {
            Self::PROCESS_STOCK => {
                let data: StockData = simd_json::serde::from_slice(payload)
                    .map_err(|error| TaskError::Failed(error.to_string()))?;
                Ok(Self::ProcessStock(data))
            }
            Self::CALCULATE_STATS => {
                let data: HashMap<String, StockData> = simd_json::serde::from_slice(payload)
                    .map_err(|error| TaskError::Failed(error.to_string()))?;
                Ok(Self::CalculateStats(data))
            }
            other => Err(TaskError::UnknownTask(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Stock(ProcessedStock),
    Stats(MarketStats),
}

#[derive(Debug)]
struct WorkerRequest {
    id: u64,
    task: TaskRequest,
}

#[derive(Debug)]
struct WorkerResponse {
    id: u64,
    outcome: Result<TaskOutput, TaskError>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<TaskOutput, TaskError>>>>>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub request_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_TASK_TIMEOUT),
        }
    }
}

/// Handle to the background worker context. Cloneable; all clones share one
/// worker task, one pending map and one id sequence.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Debug)]
struct DispatcherInner {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    cancel_token: CancellationToken,
}

impl TaskDispatcher {
    /// Starts the worker and response-router tasks. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: WorkerConfig) -> Self {
        Self::spawn_with_worker(config, run_worker)
    }

    /// A dispatcher with no worker context behind it; every dispatch is
    /// rejected immediately without registering anything.
    pub fn disconnected() -> Self {
        let (requests, _) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(DispatcherInner {
                requests,
                pending: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(0),
                request_timeout: None,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    fn spawn_with_worker<W, F>(config: WorkerConfig, worker: W) -> Self
    where
        W: FnOnce(
            mpsc::UnboundedReceiver<WorkerRequest>,
            mpsc::UnboundedSender<WorkerResponse>,
            CancellationToken,
        ) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel_token = CancellationToken::new();

        tokio::spawn(worker(request_rx, response_tx, cancel_token.clone()));
        tokio::spawn(route_responses(response_rx, Arc::clone(&pending)));

        Self {
            inner: Arc::new(DispatcherInner {
                requests: request_tx,
                pending,
                next_id: AtomicU64::new(0),
                request_timeout: config.request_timeout,
                cancel_token,
            }),
        }
    }

    /// Dispatches one task and waits for its correlated response.
    pub async fn send(&self, task: TaskRequest) -> Result<TaskOutput, TaskError> {
        if !self.is_available() {
            return Err(TaskError::WorkerUnavailable);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, reply_tx);

        if self.inner.requests.send(WorkerRequest { id, task }).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(TaskError::WorkerUnavailable);
        }

        let received = match self.inner.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.pending.lock().remove(&id);
                    return Err(TaskError::Timeout(limit));
                }
            },
            None => reply_rx.await,
        };

        received.unwrap_or(Err(TaskError::WorkerStopped))
    }

    pub async fn process_stock(&self, data: StockData) -> Result<ProcessedStock, TaskError> {
        match self.send(TaskRequest::ProcessStock(data)).await? {
            TaskOutput::Stock(processed) => Ok(processed),
            TaskOutput::Stats(_) => Err(TaskError::Failed(
                "mismatched worker response".to_string(),
            )),
        }
    }

    pub async fn calculate_stats(
        &self,
        quotes: HashMap<String, StockData>,
    ) -> Result<MarketStats, TaskError> {
        match self.send(TaskRequest::CalculateStats(quotes)).await? {
            TaskOutput::Stats(stats) => Ok(stats),
            TaskOutput::Stock(_) => Err(TaskError::Failed(
                "mismatched worker response".to_string(),
            )),
        }
    }

    /// Tears down the worker context. In-flight requests are rejected through
    /// the context-wide failure path; later dispatches reject immediately.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn is_available(&self) -> bool {
        !self.inner.cancel_token.is_cancelled() && !self.inner.requests.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

async fn run_worker(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
    cancel_token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel_token.cancelled() => break,
            maybe_request = requests.recv() => match maybe_request {
                Some(request) => request,
                None => break,
            },
        };

        let outcome = execute(request.task);
        if responses
            .send(WorkerResponse {
                id: request.id,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

fn execute(task: TaskRequest) -> Result<TaskOutput, TaskError> {
    match task {
        TaskRequest::ProcessStock(data) => {
            if !data.price.is_finite() {
                return Err(TaskError::Failed(format!(
                    "non-finite price for {}",
                    data.symbol
                )));
            }
            Ok(TaskOutput::Stock(process_stock(data)))
        }
        TaskRequest::CalculateStats(quotes) => Ok(TaskOutput::Stats(calculate_stats(&quotes))),
    }
}

async fn route_responses(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingMap,
) {
    while let Some(response) = responses.recv().await {
        let entry = pending.lock().remove(&response.id);
        match entry {
            Some(reply) => {
                let _ = reply.send(response.outcome);
            }
            None => tracing::debug!(id = response.id, "response for abandoned task"),
        }
    }

    // Worker context is gone: fail everything still in flight.
    let stranded: Vec<_> = pending.lock().drain().map(|(_, reply)| reply).collect();
    for reply in stranded {
        let _ = reply.send(Err(TaskError::WorkerStopped));
    }
}
