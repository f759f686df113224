// worker/coordinator.rs
//
// Correlates requests with responses over the worker's single stdin/stdout
// channel. Each call gets a unique id; progress is routed to the caller's
// callback, terminal messages settle the call, and a worker exit settles
// every outstanding call at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::oneshot;

use super::protocol::{classify, encode, kinds, Inbound, ProtocolError, RequestIdGenerator, WireMessage};
use super::supervisor::{WorkerError, WorkerExit, WorkerListener, WorkerSupervisor};

/// Why a call did not produce a response
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{kind} request timed out after {after:?}")]
    Timeout { kind: String, after: Duration },
    #[error("worker exited: {0}")]
    WorkerExited(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Progress notification for an in-flight call
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// `None` while the worker cannot estimate progress
    pub percent: Option<f64>,
    pub stage: String,
    pub message: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Per-call options
#[derive(Clone, Default)]
pub struct CallOptions {
    pub on_progress: Option<ProgressCallback>,
    /// No timeout when unset
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            on_progress: None,
            timeout: Some(timeout),
        }
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

struct PendingRequest {
    kind: String,
    responder: oneshot::Sender<Result<WireMessage, CallError>>,
    on_progress: Option<ProgressCallback>,
    started_at: Instant,
}

/// Outstanding requests keyed by correlation id
#[derive(Default)]
struct PendingTable {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    fn insert(&self, id: String, request: PendingRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.insert(id, request);
        }
    }

    fn remove(&self, id: &str) -> Option<PendingRequest> {
        self.requests.lock().ok().and_then(|mut r| r.remove(id))
    }

    fn len(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn settle(&self, id: &str, result: Result<WireMessage, CallError>) {
        match self.remove(id) {
            Some(request) => {
                debug!(
                    "Request {} ({}) settled after {:?}",
                    id,
                    request.kind,
                    request.started_at.elapsed()
                );
                let _ = request.responder.send(result);
            }
            None => debug!("Ignoring response for unknown or expired request {}", id),
        }
    }

    fn report_progress(&self, id: &str, update: ProgressUpdate) {
        // Clone the callback out so it never runs under the lock
        let callback = self
            .requests
            .lock()
            .ok()
            .and_then(|r| r.get(id).and_then(|p| p.on_progress.clone()));
        if let Some(callback) = callback {
            callback(update);
        }
    }
}

impl WorkerListener for PendingTable {
    fn on_message(&self, message: &WireMessage) {
        match classify(message) {
            Ok(Inbound::Ready) => {}
            Ok(Inbound::Progress {
                id: Some(id),
                percent,
                stage,
                message: text,
            }) => self.report_progress(
                &id,
                ProgressUpdate {
                    percent,
                    stage,
                    message: text,
                },
            ),
            Ok(Inbound::Error { id: Some(id), error }) => {
                self.settle(&id, Err(CallError::Remote(error)))
            }
            Ok(Inbound::Error { id: None, error }) => {
                warn!("Worker reported an uncorrelated error: {}", error)
            }
            Ok(Inbound::Response { id: Some(id) }) => self.settle(&id, Ok(message.clone())),
            Ok(other) => debug!("Ignoring uncorrelated worker message: {:?}", other),
            Err(e) => warn!("Ignoring worker message: {}", e),
        }
    }

    fn on_exit(&self, exit: &WorkerExit) {
        let drained: Vec<(String, PendingRequest)> = match self.requests.lock() {
            Ok(mut requests) => requests.drain().collect(),
            Err(_) => return,
        };

        if !drained.is_empty() {
            warn!(
                "Rejecting {} pending request(s) after worker exit (generation {})",
                drained.len(),
                exit.generation
            );
        }

        for (_, request) in drained {
            let error = if exit.requested {
                CallError::Cancelled
            } else {
                CallError::WorkerExited(exit.description.clone())
            };
            let _ = request.responder.send(Err(error));
        }
    }
}

struct PendingEntry<'a> {
    table: &'a PendingTable,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Issues requests to the supervised worker and awaits their outcomes
pub struct RequestCoordinator {
    supervisor: Arc<WorkerSupervisor>,
    pending: Arc<PendingTable>,
    ids: RequestIdGenerator,
}

impl RequestCoordinator {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        let pending = Arc::new(PendingTable::default());
        supervisor.subscribe(pending.clone());
        Self {
            supervisor,
            pending,
            ids: RequestIdGenerator::new(),
        }
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Number of calls still awaiting a terminal message
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its terminal message.
    ///
    /// Starts the worker if it is not running. Any `id` already set on the
    /// request is replaced. Dropping the returned future forgets the request;
    /// a late response for it is ignored.
    pub async fn call(
        &self,
        request: WireMessage,
        options: CallOptions,
    ) -> Result<WireMessage, CallError> {
        self.supervisor.ensure_started().await?;

        let id = self.ids.next_id();
        let kind = request.kind.clone();
        let line = encode(&request.with_id(id.clone()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                kind: kind.clone(),
                responder: tx,
                on_progress: options.on_progress,
                started_at: Instant::now(),
            },
        );
        // Removes the entry however this call ends, including being dropped
        let _entry = PendingEntry {
            table: &self.pending,
            id: id.clone(),
        };

        debug!("Sending {} request {}", kind, id);
        self.supervisor.send(&line).await?;

        let outcome = match options.timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("{} request {} timed out after {:?}", kind, id, after);
                    return Err(CallError::Timeout { kind, after });
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(CallError::WorkerExited("response channel closed".to_string())))
    }

    /// Round-trip a ping
    pub async fn ping(&self, timeout: Duration) -> Result<(), CallError> {
        self.call(WireMessage::new(kinds::PING), CallOptions::with_timeout(timeout))
            .await
            .map(|_| ())
    }

    /// Terminate the worker, rejecting every outstanding call with `Cancelled`
    pub async fn cancel(&self) {
        self.supervisor.stop().await;
    }
}
