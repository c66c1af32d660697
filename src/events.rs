//! Internal event bus.
//!
//! Components observe each other exclusively through this bus: the
//! reconnection controller and state manager react to connection lifecycle
//! events without holding owning references to the client.
//!
//! Delivery is synchronous within a single [`EventBus::emit`]: exact-name
//! listeners run first in registration order, then wildcard listeners in
//! registration order. Middleware runs before delivery and may veto an
//! emission by returning `false`.
//!
//! # Event Names
//!
//! | Prefix | Events |
//! |--------|--------|
//! | `starling:` | `connected`, `disconnected`, `error` |
//! | `starling:reconnect:` | `started`, `scheduled`, `attempt`, `failed`, `stopped`, `max_attempts` |
//! | `state:` | `refreshed` |
//! | `message:` | `request`, `response`, `notification`, `error`, `invalid` |
//! | `buffer:` | `added`, `full`, `flushed`, `cleared` |

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::ErrorObject;
use crate::identifiers::{ListenerId, RequestId};

// ============================================================================
// BusEvent
// ============================================================================

/// A structured event carried on the bus.
///
/// One variant per event name; see [`BusEvent::name`].
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Socket reached the connected state.
    Connected {
        /// Milliseconds since epoch.
        at_ms: u64,
    },

    /// Socket left the connected state.
    Disconnected {
        /// When the session had connected, if it ever did.
        last_connected_ms: Option<u64>,
        /// Close code from the peer's close frame, if one arrived.
        code: Option<u16>,
        /// Close reason from the peer's close frame.
        reason: Option<String>,
    },

    /// Transport-level error.
    SocketError {
        /// Error description.
        message: String,
    },

    /// Reconnection controller started.
    ReconnectStarted,

    /// Next reconnection attempt scheduled.
    ReconnectScheduled {
        /// 1-based attempt number about to run.
        attempt: u32,
        /// Wait before the attempt.
        delay_ms: u64,
    },

    /// Reconnection attempt beginning.
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
    },

    /// Reconnection attempt failed.
    ReconnectFailed {
        /// 1-based attempt number.
        attempt: u32,
        /// Failure description.
        message: String,
    },

    /// Reconnection controller stopped.
    ReconnectStopped,

    /// Attempt cap reached; reconnection gave up.
    ReconnectMaxAttempts {
        /// Attempts consumed since the last reset.
        attempts: u32,
    },

    /// Recovery token refreshed.
    StateRefreshed {
        /// Milliseconds since epoch.
        at_ms: u64,
    },

    /// Inbound request frame received.
    MessageRequest {
        /// Requested method.
        method: String,
        /// Correlation ID.
        request_id: RequestId,
    },

    /// Inbound response frame received.
    MessageResponse {
        /// Correlation ID.
        request_id: RequestId,
        /// Whether the peer reported success.
        success: bool,
    },

    /// Inbound notification frame received.
    MessageNotification {
        /// Topic, if topic-scoped.
        topic: Option<String>,
        /// Correlated request, if request-scoped.
        request_id: Option<RequestId>,
    },

    /// Inbound error frame with no matching pending request.
    MessageError {
        /// The error carried on the frame.
        error: ErrorObject,
    },

    /// Inbound frame failed schema validation.
    MessageInvalid {
        /// Why validation failed.
        reason: String,
    },

    /// Frame appended to the send buffer.
    BufferAdded {
        /// Buffer length after the append.
        len: usize,
    },

    /// Buffer at capacity; oldest entry dropped.
    BufferFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// Buffer flushed on (re)connect.
    BufferFlushed {
        /// Entries written.
        flushed: usize,
        /// Entries retained after write failures.
        retained: usize,
    },

    /// Buffer dropped wholesale.
    BufferCleared {
        /// Entries discarded.
        dropped: usize,
    },
}

impl BusEvent {
    /// The event name listeners subscribe to.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "starling:connected",
            Self::Disconnected { .. } => "starling:disconnected",
            Self::SocketError { .. } => "starling:error",
            Self::ReconnectStarted => "starling:reconnect:started",
            Self::ReconnectScheduled { .. } => "starling:reconnect:scheduled",
            Self::ReconnectAttempt { .. } => "starling:reconnect:attempt",
            Self::ReconnectFailed { .. } => "starling:reconnect:failed",
            Self::ReconnectStopped => "starling:reconnect:stopped",
            Self::ReconnectMaxAttempts { .. } => "starling:reconnect:max_attempts",
            Self::StateRefreshed { .. } => "state:refreshed",
            Self::MessageRequest { .. } => "message:request",
            Self::MessageResponse { .. } => "message:response",
            Self::MessageNotification { .. } => "message:notification",
            Self::MessageError { .. } => "message:error",
            Self::MessageInvalid { .. } => "message:invalid",
            Self::BufferAdded { .. } => "buffer:added",
            Self::BufferFull { .. } => "buffer:full",
            Self::BufferFlushed { .. } => "buffer:flushed",
            Self::BufferCleared { .. } => "buffer:cleared",
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Listener callback type.
pub type EventCallback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Middleware callback type. Returning `false` vetoes delivery.
pub type EventMiddleware = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;

struct BusInner {
    exact: FxHashMap<String, Vec<(ListenerId, EventCallback)>>,
    wildcard: Vec<(ListenerId, EventCallback)>,
    middleware: Vec<EventMiddleware>,
    next_id: u64,
}

// ============================================================================
// EventBus
// ============================================================================

/// Named-event pub/sub shared by all components of a client.
///
/// Cheap to clone; clones share the same listener table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                exact: FxHashMap::default(),
                wildcard: Vec::new(),
                middleware: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Registers a listener for one event name.
    pub fn on(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut inner = self.inner.lock();
        let id = ListenerId::new(inner.next_id);
        inner.next_id += 1;
        inner
            .exact
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(callback)));
        ListenerHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a wildcard listener invoked for every event, after
    /// exact-name listeners.
    pub fn on_any(
        &self,
        callback: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut inner = self.inner.lock();
        let id = ListenerId::new(inner.next_id);
        inner.next_id += 1;
        inner.wildcard.push((id, Arc::new(callback)));
        ListenerHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Installs a middleware hook run before delivery.
    ///
    /// Middleware runs in installation order; the first hook returning
    /// `false` suppresses delivery of that event.
    pub fn use_middleware(&self, hook: impl Fn(&BusEvent) -> bool + Send + Sync + 'static) {
        self.inner.lock().middleware.push(Arc::new(hook));
    }

    /// Emits an event to all matching listeners.
    ///
    /// Callbacks run on the emitting task, outside the internal lock, so
    /// listeners may re-enter the bus.
    pub fn emit(&self, event: &BusEvent) {
        let (middleware, listeners) = {
            let inner = self.inner.lock();
            let mut listeners: Vec<EventCallback> = Vec::new();
            if let Some(exact) = inner.exact.get(event.name()) {
                listeners.extend(exact.iter().map(|(_, cb)| Arc::clone(cb)));
            }
            listeners.extend(inner.wildcard.iter().map(|(_, cb)| Arc::clone(cb)));
            (inner.middleware.clone(), listeners)
        };

        for hook in &middleware {
            if !hook(event) {
                trace!(event = event.name(), "event vetoed by middleware");
                return;
            }
        }

        for listener in listeners {
            listener(event);
        }
    }

    fn remove(inner: &Arc<Mutex<BusInner>>, id: ListenerId) -> bool {
        let mut inner = inner.lock();
        let mut removed = false;
        for listeners in inner.exact.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        let before = inner.wildcard.len();
        inner.wildcard.retain(|(lid, _)| *lid != id);
        removed | (inner.wildcard.len() != before)
    }
}

// ============================================================================
// ListenerHandle
// ============================================================================

/// Disposer for a registered listener.
///
/// Dropping the handle does not unsubscribe; call [`dispose`](Self::dispose).
pub struct ListenerHandle {
    id: ListenerId,
    bus: Weak<Mutex<BusInner>>,
}

impl ListenerHandle {
    /// The listener's ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn dispose(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => EventBus::remove(&inner, self.id),
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
