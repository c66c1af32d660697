//! Recovery-token state manager.
//!
//! Keeps the server-issued recovery token fresh by calling the protocol's
//! `starling:state` method, throttled by a minimum interval and retried on
//! failure. The client reads the token at connect time to build the
//! `recover` query parameter.
//!
//! The manager observes the connection through the event bus: on reconnect
//! it accounts downtime and (by default) forces a refresh; on disconnect it
//! parks the scheduled refresh.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus};
use crate::protocol::frame::now_ms;

// ============================================================================
// Constants
// ============================================================================

/// Protocol method called to obtain a fresh recovery token.
pub const STATE_REFRESH_METHOD: &str = "starling:state";

// ============================================================================
// StateOptions
// ============================================================================

/// Refresh loop configuration.
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Interval between scheduled refreshes.
    pub refresh_interval: Duration,

    /// Minimum spacing enforced on non-forced refreshes.
    pub min_refresh_interval: Duration,

    /// Attempts per refresh before giving up.
    pub retry_attempts: u32,

    /// Wait between retry attempts.
    pub retry_delay: Duration,

    /// Whether a reconnect triggers an immediate forced refresh.
    pub force_refresh_on_reconnect: bool,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            min_refresh_interval: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            force_refresh_on_reconnect: true,
        }
    }
}

// ============================================================================
// StateMetrics
// ============================================================================

/// Snapshot of refresh and downtime accounting.
#[derive(Debug, Clone, Default)]
pub struct StateMetrics {
    /// Successful refreshes.
    pub refreshes: u64,

    /// Failed refresh attempts.
    pub refresh_failures: u64,

    /// Reconnections observed.
    pub reconnections: u64,

    /// Accumulated downtime, milliseconds.
    pub total_downtime_ms: u64,

    /// When the connection last dropped, milliseconds since epoch.
    pub last_disconnect_ms: Option<u64>,
}

// ============================================================================
// Types
// ============================================================================

/// Issues a protocol request on behalf of the manager. The client wires
/// this to its normal request path.
pub(crate) type Requester =
    Arc<dyn Fn(String, Option<Duration>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct MetricsState {
    refreshes: u64,
    refresh_failures: u64,
    reconnections: u64,
    total_downtime: Duration,
}

struct StateInner {
    options: StateOptions,
    bus: EventBus,
    requester: Requester,
    token: Mutex<Option<String>>,
    refreshing: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
    last_disconnect: Mutex<Option<(Instant, u64)>>,
    scheduled: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<MetricsState>,
}

// ============================================================================
// StateManager
// ============================================================================

/// Owns the recovery token and the refresh loop.
pub struct StateManager {
    inner: Arc<StateInner>,
}

impl StateManager {
    pub(crate) fn new(options: StateOptions, bus: EventBus, requester: Requester) -> Self {
        let inner = Arc::new(StateInner {
            options,
            bus: bus.clone(),
            requester,
            token: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
            last_disconnect: Mutex::new(None),
            scheduled: Mutex::new(None),
            metrics: Mutex::new(MetricsState {
                refreshes: 0,
                refresh_failures: 0,
                reconnections: 0,
                total_downtime: Duration::ZERO,
            }),
        });

        let weak = Arc::downgrade(&inner);
        bus.on("starling:connected", move |_| {
            if let Some(inner) = weak.upgrade() {
                StateInner::handle_connected(&inner);
            }
        });

        let weak = Arc::downgrade(&inner);
        bus.on("starling:disconnected", move |_| {
            if let Some(inner) = weak.upgrade() {
                StateInner::handle_disconnected(&inner);
            }
        });

        Self { inner }
    }

    /// Refreshes the recovery token.
    ///
    /// Non-forced refreshes are throttled by `min_refresh_interval`. The
    /// underlying request is retried up to `retry_attempts` times with
    /// `retry_delay` between attempts.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshInProgress`] if a refresh is already running
    /// - [`Error::MinIntervalNotReached`] when throttled
    /// - [`Error::StateRefreshFailed`] after exhausting retries
    pub async fn refresh(&self, force: bool, timeout: Option<Duration>) -> Result<String> {
        StateInner::refresh(&self.inner, force, timeout).await
    }

    /// The current recovery token, if one is held.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().clone()
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> StateMetrics {
        let metrics = self.inner.metrics.lock();
        StateMetrics {
            refreshes: metrics.refreshes,
            refresh_failures: metrics.refresh_failures,
            reconnections: metrics.reconnections,
            total_downtime_ms: metrics.total_downtime.as_millis() as u64,
            last_disconnect_ms: self.inner.last_disconnect.lock().map(|(_, ms)| ms),
        }
    }

    /// Cancels the scheduled refresh, if one is parked.
    pub(crate) fn abort_scheduled(&self) {
        if let Some(task) = self.inner.scheduled.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        self.abort_scheduled();
    }
}

// ============================================================================
// Refresh Loop
// ============================================================================

impl StateInner {
    async fn refresh(
        inner: &Arc<StateInner>,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<String> {
        if inner
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::RefreshInProgress);
        }

        let result = Self::refresh_inner(inner, force, timeout).await;
        inner.refreshing.store(false, Ordering::SeqCst);
        result
    }

    async fn refresh_inner(
        inner: &Arc<StateInner>,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<String> {
        if !force
            && let Some(last) = *inner.last_refresh.lock()
        {
            let elapsed = last.elapsed();
            if elapsed < inner.options.min_refresh_interval {
                let remaining = inner.options.min_refresh_interval - elapsed;
                return Err(Error::min_interval_not_reached(remaining.as_millis() as u64));
            }
        }

        let attempts = inner.options.retry_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=attempts {
            match (inner.requester)(STATE_REFRESH_METHOD.to_string(), timeout).await {
                Ok(data) => {
                    if let Some(token) = data.get("token").and_then(Value::as_str) {
                        *inner.token.lock() = Some(token.to_string());
                        *inner.last_refresh.lock() = Some(Instant::now());
                        inner.metrics.lock().refreshes += 1;
                        Self::schedule_next(inner);
                        inner.bus.emit(&BusEvent::StateRefreshed { at_ms: now_ms() });
                        debug!(attempt, "recovery token refreshed");
                        return Ok(token.to_string());
                    }

                    inner.metrics.lock().refresh_failures += 1;
                    warn!(attempt, "state response missing token");
                    last_error = Some("response missing token".to_string());
                }
                Err(err) => {
                    inner.metrics.lock().refresh_failures += 1;
                    warn!(attempt, error = %err, "state refresh attempt failed");
                    last_error = Some(err.to_string());
                }
            }

            if attempt < attempts {
                tokio::time::sleep(inner.options.retry_delay).await;
            }
        }

        Err(Error::state_refresh_failed(
            last_error.unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }

    fn schedule_next(inner: &Arc<StateInner>) {
        let mut scheduled = inner.scheduled.lock();
        if let Some(task) = scheduled.take() {
            task.abort();
        }

        let weak = Arc::downgrade(inner);
        let interval = inner.options.refresh_interval;
        *scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade()
                && let Err(err) = Self::refresh(&inner, false, None).await
            {
                debug!(error = %err, "scheduled refresh failed");
            }
        }));
    }

    fn handle_connected(inner: &Arc<StateInner>) {
        if let Some((at, _)) = inner.last_disconnect.lock().take() {
            let mut metrics = inner.metrics.lock();
            metrics.reconnections += 1;
            metrics.total_downtime += at.elapsed();
        }

        if inner.options.force_refresh_on_reconnect {
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade()
                    && let Err(err) = Self::refresh(&inner, true, None).await
                {
                    debug!(error = %err, "forced refresh after connect failed");
                }
            });
        }
    }

    fn handle_disconnected(inner: &Arc<StateInner>) {
        *inner.last_disconnect.lock() = Some((Instant::now(), now_ms()));
        if let Some(task) = inner.scheduled.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
