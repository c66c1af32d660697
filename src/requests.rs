//! Outbound request registry.
//!
//! Correlates outbound requests to their responses by [`RequestId`], arms a
//! per-request timeout, and carries the per-request progress stream.
//!
//! # Request Lifecycle
//!
//! ```text
//! register ──► pending ──► completed   (matching success response)
//!                     ├──► failed      (matching failure response / error frame)
//!                     ├──► timed_out   (timeout expiry)
//!                     └──► cancelled   (explicit cancel / connection teardown)
//! ```
//!
//! Exactly one terminal transition fires per request; frames arriving after
//! the terminal transition are dropped silently.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorObject, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Enforced ceiling on per-request timeouts.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on concurrently pending requests.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// RequestState
// ============================================================================

/// Lifecycle state of a client-held request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Awaiting a response.
    Pending,
    /// Resolved by a success response.
    Completed,
    /// Resolved by a failure response or correlated error frame.
    Failed,
    /// Cancelled locally.
    Cancelled,
    /// Timed out waiting for a response.
    TimedOut,
}

// ============================================================================
// RequestOptions
// ============================================================================

/// Options for an outbound request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Response timeout; defaults to [`DEFAULT_REQUEST_TIMEOUT`], capped at
    /// [`MAX_REQUEST_TIMEOUT`].
    pub timeout: Option<Duration>,

    /// Whether the request frame may be buffered while offline. When
    /// `false` and the socket is down, the request fails immediately.
    pub retry: bool,

    /// Caller metadata forwarded on the wire `options` field.
    pub metadata: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: true,
            metadata: None,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

type ProgressCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct PendingRequest {
    method: String,
    state: RequestState,
    created_at: Instant,
    outcome_tx: oneshot::Sender<Result<Value>>,
    progress: Vec<ProgressCallback>,
    timeout_task: Option<JoinHandle<()>>,
}

// ============================================================================
// RequestRegistry
// ============================================================================

/// Table of in-flight requests, keyed by [`RequestId`].
pub struct RequestRegistry {
    weak: Weak<RequestRegistry>,
    pending: Mutex<FxHashMap<RequestId, PendingRequest>>,
    default_timeout: Duration,
    max_pending: usize,
}

impl RequestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(default_timeout: Duration, max_pending: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            pending: Mutex::new(FxHashMap::default()),
            default_timeout,
            max_pending,
        })
    }

    /// Registers a fresh request and arms its timeout.
    ///
    /// The returned handle resolves when a terminal transition fires.
    /// The caller is responsible for building and sending the request frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyRequests`] when the table is full.
    pub fn register(&self, method: &str, options: &RequestOptions) -> Result<RequestHandle> {
        let id = RequestId::generate();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                warn!(
                    pending = pending.len(),
                    max = self.max_pending,
                    "too many pending requests"
                );
                return Err(Error::too_many_requests(pending.len(), self.max_pending));
            }
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    state: RequestState::Pending,
                    created_at: Instant::now(),
                    outcome_tx,
                    progress: Vec::new(),
                    timeout_task: None,
                },
            );
        }

        let timeout = options
            .timeout
            .unwrap_or(self.default_timeout)
            .min(MAX_REQUEST_TIMEOUT);
        let weak = self.weak.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = weak.upgrade() {
                registry.expire(id, timeout);
            }
        });

        if let Some(entry) = self.pending.lock().get_mut(&id) {
            entry.timeout_task = Some(timeout_task);
        }

        trace!(request_id = %id, method, timeout_ms = timeout.as_millis() as u64, "request registered");

        Ok(RequestHandle {
            id,
            registry: self.weak.clone(),
            outcome: outcome_rx,
        })
    }

    /// Resolves a request with the peer's success data.
    ///
    /// Returns `false` if the request is unknown or already terminal; the
    /// frame is then dropped.
    pub fn complete(&self, id: RequestId, data: Value) -> bool {
        self.resolve(id, RequestState::Completed, Ok(data))
    }

    /// Resolves a request with the peer's failure.
    pub fn fail(&self, id: RequestId, error: ErrorObject) -> bool {
        self.resolve(id, RequestState::Failed, Err(Error::request_failed(error)))
    }

    /// Resolves a request with a local error, bypassing the wire.
    pub fn fail_local(&self, id: RequestId, error: Error) -> bool {
        self.resolve(id, RequestState::Failed, Err(error))
    }

    /// Cancels one request.
    pub fn cancel(&self, id: RequestId, reason: &str) -> bool {
        self.resolve(
            id,
            RequestState::Cancelled,
            Err(Error::request_cancelled(reason)),
        )
    }

    /// Cancels every pending request, clearing the table.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<(RequestId, PendingRequest)> =
            self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, entry) in drained {
            if let Some(task) = entry.timeout_task {
                task.abort();
            }
            trace!(request_id = %id, method = %entry.method, "request cancelled");
            let _ = entry.outcome_tx.send(Err(Error::request_cancelled(reason)));
        }

        if count > 0 {
            debug!(count, reason, "cancelled pending requests");
        }
    }

    /// Delivers a progress notification to a pending request's stream.
    ///
    /// Returns `false` if no request with this ID is pending.
    pub fn deliver_progress(&self, id: RequestId, data: &Value) -> bool {
        let callbacks: Vec<ProgressCallback> = {
            let pending = self.pending.lock();
            match pending.get(&id) {
                Some(entry) => entry.progress.iter().map(Arc::clone).collect(),
                None => return false,
            }
        };

        for callback in callbacks {
            callback(data);
        }
        true
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if no requests are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Returns `true` if the given request is still pending.
    #[must_use]
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    fn add_progress(&self, id: RequestId, callback: ProgressCallback) {
        if let Some(entry) = self.pending.lock().get_mut(&id) {
            entry.progress.push(callback);
        }
    }

    fn expire(&self, id: RequestId, timeout: Duration) {
        self.resolve(
            id,
            RequestState::TimedOut,
            Err(Error::request_timeout(id, timeout.as_millis() as u64)),
        );
    }

    fn resolve(&self, id: RequestId, state: RequestState, outcome: Result<Value>) -> bool {
        let entry = self.pending.lock().remove(&id);
        let Some(mut entry) = entry else {
            trace!(request_id = %id, "late frame for unknown request dropped");
            return false;
        };

        if let Some(task) = entry.timeout_task.take() {
            task.abort();
        }
        entry.state = state;
        trace!(
            request_id = %id,
            method = %entry.method,
            ?state,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "request resolved"
        );

        // The receiver may be gone if the caller dropped the handle.
        let _ = entry.outcome_tx.send(outcome);
        true
    }
}

// ============================================================================
// RequestHandle
// ============================================================================

/// Handle to an in-flight request.
///
/// Awaiting the handle yields the response data or the structured failure.
/// Progress callbacks can be chained before awaiting:
///
/// ```ignore
/// let data = client
///     .request("files:download", Some(payload), Default::default())?
///     .on_progress(|p| println!("progress: {p}"))
///     .await?;
/// ```
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    registry: Weak<RequestRegistry>,
    outcome: oneshot::Receiver<Result<Value>>,
}

impl RequestHandle {
    /// The request's correlation ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Registers a progress callback, invoked for every notification
    /// carrying this request's ID while the request is pending.
    #[must_use]
    pub fn on_progress(self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        if let Some(registry) = self.registry.upgrade() {
            registry.add_progress(self.id, Arc::new(callback));
        }
        self
    }

    /// Alias of [`on_progress`](Self::on_progress); the protocol names the
    /// same stream both ways.
    #[must_use]
    pub fn on_notification(self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_progress(callback)
    }

    /// Cancels the request. The handle then resolves with
    /// `REQUEST_CANCELLED`.
    pub fn cancel(&self, reason: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.cancel(self.id, reason);
        }
    }
}

impl Future for RequestHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.outcome).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
