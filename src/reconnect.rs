//! Reconnection controller.
//!
//! Drives connection attempts after an unexpected disconnect: exponential
//! backoff with a cap, an optional attempt limit, reset of the backoff
//! state after a quiet period, and abortable in-flight attempts.
//!
//! The controller observes the client through a connector closure and the
//! event bus only; it never holds an owning reference.
//!
//! Backoff growth is applied *before* each wait, so the first wait is
//! `min_delay * backoff_multiplier`, not `min_delay`.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{BusEvent, EventBus};
use crate::protocol::frame::now_ms;

// ============================================================================
// Constants
// ============================================================================

/// How many attempt durations the metrics window keeps.
const ATTEMPT_DURATION_WINDOW: usize = 10;

// ============================================================================
// ReconnectOptions
// ============================================================================

/// Backoff and cap configuration.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Initial backoff value. The first actual wait is
    /// `min_delay * backoff_multiplier`; growth applies before each wait.
    pub min_delay: Duration,

    /// Ceiling on the backoff delay.
    pub max_delay: Duration,

    /// Attempt cap since the last reset; `None` means unbounded.
    pub max_attempts: Option<u32>,

    /// Backoff growth factor.
    pub backoff_multiplier: f64,

    /// Quiet period after which the attempt counter and delay reset.
    pub reset_threshold: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            backoff_multiplier: 1.5,
            reset_threshold: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// ReconnectionMetrics
// ============================================================================

/// Snapshot of reconnection activity.
#[derive(Debug, Clone, Default)]
pub struct ReconnectionMetrics {
    /// Attempts across the controller's lifetime.
    pub total_attempts: u64,

    /// Attempts that reached the connected state.
    pub successful_reconnections: u64,

    /// Attempts that failed.
    pub failed_attempts: u64,

    /// Attempts since the last reset.
    pub attempts_since_reset: u32,

    /// When the last attempt started, milliseconds since epoch.
    pub last_attempt_ms: Option<u64>,

    /// When the last attempt succeeded, milliseconds since epoch.
    pub last_success_ms: Option<u64>,

    /// When the backoff state last reset, milliseconds since epoch.
    pub last_reset_ms: u64,

    /// Durations of the last few successful attempts.
    pub attempt_durations_ms: Vec<u64>,

    /// Mean of [`attempt_durations_ms`](Self::attempt_durations_ms).
    pub average_attempt_ms: Option<f64>,
}

// ============================================================================
// Types
// ============================================================================

/// Connection attempt issued by the controller.
pub(crate) type Connector = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct ControllerState {
    active: bool,
    current_delay: Duration,
    attempts: u32,
    last_reset: Instant,
    last_reset_ms: u64,
    cancel: Option<CancellationToken>,
    total_attempts: u64,
    successful_reconnections: u64,
    failed_attempts: u64,
    last_attempt_ms: Option<u64>,
    last_success_ms: Option<u64>,
    attempt_durations: VecDeque<Duration>,
}

struct ControllerInner {
    options: ReconnectOptions,
    bus: EventBus,
    connector: Connector,
    state: Mutex<ControllerState>,
}

// ============================================================================
// ReconnectionController
// ============================================================================

/// Backoff scheduler for reconnection attempts.
pub struct ReconnectionController {
    inner: Arc<ControllerInner>,
}

impl ReconnectionController {
    pub(crate) fn new(options: ReconnectOptions, bus: EventBus, connector: Connector) -> Self {
        let current_delay = options.min_delay;
        Self {
            inner: Arc::new(ControllerInner {
                options,
                bus,
                connector,
                state: Mutex::new(ControllerState {
                    active: false,
                    current_delay,
                    attempts: 0,
                    last_reset: Instant::now(),
                    last_reset_ms: now_ms(),
                    cancel: None,
                    total_attempts: 0,
                    successful_reconnections: 0,
                    failed_attempts: 0,
                    last_attempt_ms: None,
                    last_success_ms: None,
                    attempt_durations: VecDeque::new(),
                }),
            }),
        }
    }

    /// Starts the scheduling loop. No-op if already active.
    ///
    /// Resets the attempt counter and delay first when the quiet period
    /// since the last reset exceeds `reset_threshold`.
    pub fn start(&self) {
        let token = {
            let mut state = self.inner.state.lock();
            if state.active {
                return;
            }
            state.active = true;
            if state.last_reset.elapsed() >= self.inner.options.reset_threshold {
                debug!("reconnection backoff reset after quiet period");
                state.attempts = 0;
                state.current_delay = self.inner.options.min_delay;
                state.last_reset = Instant::now();
                state.last_reset_ms = now_ms();
            }
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            token
        };

        self.inner.bus.emit(&BusEvent::ReconnectStarted);
        tokio::spawn(Self::run_loop(Arc::clone(&self.inner), token, false));
    }

    /// Stops the loop and aborts any in-flight attempt.
    pub fn stop(&self) {
        Self::deactivate(&self.inner);
    }

    /// Stops the current loop and immediately retries, skipping the wait.
    pub fn force_attempt(&self) {
        Self::deactivate(&self.inner);
        let token = {
            let mut state = self.inner.state.lock();
            state.active = true;
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            token
        };
        tokio::spawn(Self::run_loop(Arc::clone(&self.inner), token, true));
    }

    /// Stops the loop and reinitializes backoff state and metrics.
    pub fn reset(&self) {
        Self::deactivate(&self.inner);
        let mut state = self.inner.state.lock();
        state.attempts = 0;
        state.current_delay = self.inner.options.min_delay;
        state.last_reset = Instant::now();
        state.last_reset_ms = now_ms();
        state.total_attempts = 0;
        state.successful_reconnections = 0;
        state.failed_attempts = 0;
        state.last_attempt_ms = None;
        state.last_success_ms = None;
        state.attempt_durations.clear();
    }

    /// Returns `true` while the scheduling loop is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ReconnectionMetrics {
        let state = self.inner.state.lock();
        let durations: Vec<u64> = state
            .attempt_durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        let average = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
        };

        ReconnectionMetrics {
            total_attempts: state.total_attempts,
            successful_reconnections: state.successful_reconnections,
            failed_attempts: state.failed_attempts,
            attempts_since_reset: state.attempts,
            last_attempt_ms: state.last_attempt_ms,
            last_success_ms: state.last_success_ms,
            last_reset_ms: state.last_reset_ms,
            attempt_durations_ms: durations,
            average_attempt_ms: average,
        }
    }

    fn deactivate(inner: &Arc<ControllerInner>) {
        let was_active = {
            let mut state = inner.state.lock();
            let was_active = state.active;
            state.active = false;
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            was_active
        };
        if was_active {
            inner.bus.emit(&BusEvent::ReconnectStopped);
        }
    }

    async fn run_loop(inner: Arc<ControllerInner>, token: CancellationToken, mut skip_wait: bool) {
        loop {
            // Attempt cap.
            {
                let state = inner.state.lock();
                if !state.active {
                    return;
                }
                if let Some(max) = inner.options.max_attempts
                    && state.attempts >= max
                {
                    drop(state);
                    warn!(attempts = max, "reconnection attempt cap reached");
                    inner.bus.emit(&BusEvent::ReconnectMaxAttempts { attempts: max });
                    Self::deactivate(&inner);
                    return;
                }
            }

            if !skip_wait {
                let (attempt, delay) = {
                    let mut state = inner.state.lock();
                    let grown = state.current_delay.as_secs_f64()
                        * inner.options.backoff_multiplier;
                    let delay = Duration::from_secs_f64(grown).min(inner.options.max_delay);
                    state.current_delay = delay;
                    (state.attempts + 1, delay)
                };
                inner.bus.emit(&BusEvent::ReconnectScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            skip_wait = false;

            let attempt = {
                let mut state = inner.state.lock();
                if !state.active {
                    return;
                }
                state.attempts += 1;
                state.total_attempts += 1;
                state.last_attempt_ms = Some(now_ms());
                state.attempts
            };
            inner.bus.emit(&BusEvent::ReconnectAttempt { attempt });

            let started = Instant::now();
            let result = tokio::select! {
                () = token.cancelled() => {
                    // An aborted attempt is not counted as a failure.
                    debug!(attempt, "reconnection attempt aborted");
                    return;
                }
                result = (inner.connector)() => result,
            };

            match result {
                Ok(()) => {
                    {
                        let mut state = inner.state.lock();
                        state.successful_reconnections += 1;
                        state.last_success_ms = Some(now_ms());
                        state.attempt_durations.push_back(started.elapsed());
                        while state.attempt_durations.len() > ATTEMPT_DURATION_WINDOW {
                            state.attempt_durations.pop_front();
                        }
                    }
                    debug!(attempt, "reconnection succeeded");
                    Self::deactivate(&inner);
                    return;
                }
                Err(err) => {
                    inner.state.lock().failed_attempts += 1;
                    inner.bus.emit(&BusEvent::ReconnectFailed {
                        attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
