//! Client core.
//!
//! [`Starling`] owns the socket session and drives the connection state
//! machine. It is the single writer to the transport; every other component
//! reaches the wire through it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Starling                          │
//! │  request/notify/send ──► codec ──► SendBuffer ──► sink  │
//! │  stream ──► codec ──► methods / requests / topics       │
//! │  bus ◄── lifecycle events ──► reconnect, state manager  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The connection spawns a tokio task that `select!`s over the socket read
//! half and an internal command channel; see PROTOCOL.md Section 3 for the
//! state machine and Section 4 for inbound routing.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::buffer::{DEFAULT_BUFFER_CAPACITY, SendBuffer};
use crate::error::{Error, ErrorObject, Result};
use crate::events::{BusEvent, EventBus, ListenerHandle};
use crate::methods::context::{RequestContext, ResponseSink};
use crate::methods::{MethodOptions, MethodRegistry};
use crate::protocol::codec::{self, Decoded};
use crate::protocol::frame::{Frame, FrameBody, now_ms};
use crate::reconnect::{Connector, ReconnectOptions, ReconnectionController, ReconnectionMetrics};
use crate::requests::{
    DEFAULT_MAX_PENDING_REQUESTS, DEFAULT_REQUEST_TIMEOUT, RequestHandle, RequestOptions,
    RequestRegistry,
};
use crate::state::{Requester, StateManager, StateMetrics, StateOptions};
use crate::topics::{SubscribeOptions, SubscriptionHandle, TopicEvent, TopicRouter};
use crate::transport::{Transport, TungsteniteTransport, WsSink, WsStream};

// ============================================================================
// Constants
// ============================================================================

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code used for graceful client-initiated closes.
const NORMAL_CLOSE_CODE: u16 = 1000;

// ============================================================================
// ConnectionState
// ============================================================================

/// Connection lifecycle state.
///
/// ```text
/// disconnected ──connect()──► connecting ──open──► connected
///       ▲                         │                    │
///       ├──close/error/timeout────┘      disconnect()──► closing
///       └──────────────socket close──────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Socket opening.
    Connecting,
    /// Socket open and usable.
    Connected,
    /// Graceful close in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        })
    }
}

// ============================================================================
// StarlingOptions
// ============================================================================

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct StarlingOptions {
    /// How long `connect()` waits for the socket to open.
    pub connect_timeout: Duration,

    /// Default per-request timeout.
    pub request_timeout: Duration,

    /// Send buffer capacity.
    pub buffer_capacity: usize,

    /// Cap on concurrently pending requests.
    pub max_pending_requests: usize,

    /// Whether unexpected disconnects trigger reconnection.
    pub reconnect: bool,

    /// Backoff configuration.
    pub reconnect_options: ReconnectOptions,

    /// Recovery-token refresh configuration.
    pub state_options: StateOptions,
}

impl Default for StarlingOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            reconnect: true,
            reconnect_options: ReconnectOptions::default(),
            state_options: StateOptions::default(),
        }
    }
}

// ============================================================================
// Internal Types
// ============================================================================

enum LoopCommand {
    Send { text: String },
    Close { code: u16, reason: String },
}

struct Session {
    command_tx: mpsc::UnboundedSender<LoopCommand>,
    task: JoinHandle<()>,
}

type TextHook = Arc<dyn Fn(&str) + Send + Sync>;
type JsonHook = Arc<dyn Fn(&Value) + Send + Sync>;
type BinaryHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_text: Mutex<Option<TextHook>>,
    on_json: Mutex<Option<JsonHook>>,
    on_binary: Mutex<Option<BinaryHook>>,
    on_notification: Mutex<Option<JsonHook>>,
}

pub(crate) struct ClientInner {
    url: String,
    options: StarlingOptions,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    buffer: Mutex<SendBuffer>,
    requests: Arc<RequestRegistry>,
    methods: MethodRegistry,
    topics: TopicRouter,
    reconnect: ReconnectionController,
    state_manager: StateManager,
    last_connected_ms: Mutex<Option<u64>>,
    hooks: Hooks,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reconnect.stop();
        if let Some(session) = self.session.lock().take() {
            session.task.abort();
        }
    }
}

// ============================================================================
// StarlingBuilder
// ============================================================================

/// Builder for [`Starling`].
///
/// ```no_run
/// use starling_client::Starling;
///
/// # fn main() -> starling_client::Result<()> {
/// let client = Starling::builder("wss://helios.example/ws")
///     .reconnect(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct StarlingBuilder {
    url: String,
    options: StarlingOptions,
    transport: Option<Arc<dyn Transport>>,
}

impl StarlingBuilder {
    /// Starts a builder for the given server URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: StarlingOptions::default(),
            transport: None,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Sets the default per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    /// Sets the send buffer capacity.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.options.buffer_capacity = capacity;
        self
    }

    /// Sets the pending-request cap.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.options.max_pending_requests = max;
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.options.reconnect = enabled;
        self
    }

    /// Sets the backoff configuration.
    #[must_use]
    pub fn reconnect_options(mut self, options: ReconnectOptions) -> Self {
        self.options.reconnect_options = options;
        self
    }

    /// Sets the recovery-token refresh configuration.
    #[must_use]
    pub fn state_options(mut self, options: StateOptions) -> Self {
        self.options.state_options = options;
        self
    }

    /// Replaces the whole options block.
    #[must_use]
    pub fn options(mut self, options: StarlingOptions) -> Self {
        self.options = options;
        self
    }

    /// Injects a custom transport. Defaults to [`TungsteniteTransport`].
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the URL does not parse.
    pub fn build(self) -> Result<Starling> {
        Url::parse(&self.url)
            .map_err(|err| Error::connection(format!("invalid url '{}': {err}", self.url)))?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));
        let bus = EventBus::new();
        let options = self.options;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let connector: Connector = {
                let weak = weak.clone();
                Arc::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(inner) => Starling { inner }.connect().await,
                            None => Err(Error::ConnectionClosed),
                        }
                    })
                })
            };

            let requester: Requester = {
                let weak = weak.clone();
                Arc::new(move |method, timeout| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else {
                            return Err(Error::ConnectionClosed);
                        };
                        let client = Starling { inner };
                        let request_options = RequestOptions {
                            timeout,
                            ..Default::default()
                        };
                        client.request(&method, None, request_options)?.await
                    })
                })
            };

            ClientInner {
                url: self.url,
                buffer: Mutex::new(SendBuffer::new(options.buffer_capacity, bus.clone())),
                requests: RequestRegistry::new(
                    options.request_timeout,
                    options.max_pending_requests,
                ),
                methods: MethodRegistry::new(),
                topics: TopicRouter::new(),
                reconnect: ReconnectionController::new(
                    options.reconnect_options.clone(),
                    bus.clone(),
                    connector,
                ),
                state_manager: StateManager::new(
                    options.state_options.clone(),
                    bus.clone(),
                    requester,
                ),
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                last_connected_ms: Mutex::new(None),
                hooks: Hooks::default(),
                transport,
                bus,
                options,
            }
        });

        Ok(Starling { inner })
    }
}

// ============================================================================
// Starling
// ============================================================================

/// A helios-starling client.
///
/// Cheap to clone; clones share one connection. The last clone dropping
/// tears the session down.
#[derive(Clone)]
pub struct Starling {
    inner: Arc<ClientInner>,
}

impl Starling {
    /// Starts a builder.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> StarlingBuilder {
        StarlingBuilder::new(url)
    }

    /// Builds a client with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the URL does not parse.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).build()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connects to the server, resolving once the socket is open.
    ///
    /// A held recovery token is attached as the `recover` query parameter.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if called while not disconnected
    /// - [`Error::ConnectionTimeout`] if the socket does not open in time
    /// - Transport errors from the underlying connect
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(Error::connection(format!(
                    "cannot connect while {state}"
                )));
            }
            *state = ConnectionState::Connecting;
        }

        let url = match self.build_url() {
            Ok(url) => url,
            Err(err) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                return Err(err);
            }
        };

        let timeout = self.inner.options.connect_timeout;
        debug!(url = %url, "connecting");
        let stream = match tokio::time::timeout(timeout, self.inner.transport.connect(&url)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.fail_connect();
                return Err(err);
            }
            Err(_) => {
                self.fail_connect();
                return Err(Error::connection_timeout(timeout.as_millis() as u64));
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Connecting {
                return Err(Error::connection("connect aborted"));
            }
            let task = tokio::spawn(run_event_loop(
                Arc::downgrade(&self.inner),
                stream.sink,
                stream.stream,
                command_rx,
            ));
            *self.inner.session.lock() = Some(Session { command_tx, task });
            *self.inner.last_connected_ms.lock() = Some(now_ms());
            *state = ConnectionState::Connected;
        }

        debug!("connected");
        self.inner.bus.emit(&BusEvent::Connected { at_ms: now_ms() });
        Ok(())
    }

    /// Gracefully disconnects, resolving once the socket is closed.
    ///
    /// Stops reconnection, cancels every pending request with `reason`,
    /// clears the send buffer and non-persistent subscriptions, then closes
    /// with code 1000.
    pub async fn disconnect(&self, reason: Option<&str>) -> Result<()> {
        let reason = reason.unwrap_or("Client disconnect");

        self.inner.reconnect.stop();
        self.inner.requests.cancel_all(reason);
        self.inner.buffer.lock().clear();
        self.inner.topics.clear_transient();
        self.inner.state_manager.abort_scheduled();

        let session = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Closing;
            self.inner.session.lock().take()
        };

        match session {
            Some(session) => {
                let _ = session.command_tx.send(LoopCommand::Close {
                    code: NORMAL_CLOSE_CODE,
                    reason: reason.to_string(),
                });
                let _ = session.task.await;
            }
            None => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Send Path
    // ========================================================================

    /// Sends a frame, buffering it if the socket is down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the frame does not serialize.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let text = codec::encode(frame)?;
        send_text(&self.inner, text);
        Ok(())
    }

    /// Sends a topic notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the frame does not serialize.
    pub fn notify(&self, topic: impl Into<String>, data: Value) -> Result<()> {
        self.send(&Frame::notification(topic, data))
    }

    /// Sends a progress notification correlated to a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the frame does not serialize.
    pub fn notify_request(&self, request_id: crate::RequestId, data: Value) -> Result<()> {
        self.send(&Frame::progress(request_id, data))
    }

    /// Invokes a method on the server.
    ///
    /// Returns a [`RequestHandle`]; await it for the response, chain
    /// [`on_progress`](RequestHandle::on_progress) for the notification
    /// stream. With the socket down and `options.retry` disabled, the
    /// handle resolves immediately with `REQUEST_FAILED`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyRequests`] when the pending table is full.
    pub fn request(
        &self,
        method: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        let handle = self.inner.requests.register(method, &options)?;

        if self.state() != ConnectionState::Connected && !options.retry {
            self.inner.requests.fail(
                handle.id(),
                ErrorObject::new("REQUEST_FAILED", "connection unavailable"),
            );
            return Ok(handle);
        }

        let frame = Frame::request(handle.id(), method, payload, options.metadata);
        self.send(&frame)?;
        Ok(handle)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers a method the server can invoke.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMethodName`], [`Error::NameReserved`], or
    /// [`Error::MethodExists`].
    pub fn register_method<F, Fut>(
        &self,
        name: &str,
        handler: F,
        options: MethodOptions,
    ) -> Result<()>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.methods.register(name, handler, options)
    }

    /// Subscribes to server notifications matching a topic pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(TopicEvent) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.inner.topics.subscribe(pattern, handler, options)
    }

    // ========================================================================
    // State & Recovery
    // ========================================================================

    /// Refreshes the recovery token, resolving with the fresh token.
    ///
    /// # Errors
    ///
    /// See [`StateManager::refresh`](crate::state::StateManager::refresh).
    pub async fn sync(&self) -> Result<String> {
        self.inner.state_manager.refresh(false, None).await
    }

    /// The recovery token currently held, if any.
    #[must_use]
    pub fn recovery_token(&self) -> Option<String> {
        self.inner.state_manager.token()
    }

    /// Forces an immediate reconnection attempt, e.g. after the attempt cap
    /// was reached.
    pub fn force_reconnect(&self) {
        self.inner.reconnect.force_attempt();
    }

    // ========================================================================
    // Hooks & Events
    // ========================================================================

    /// Registers the hook for non-JSON inbound text frames.
    pub fn on_text(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.hooks.on_text.lock() = Some(Arc::new(hook));
    }

    /// Registers the hook for JSON frames that fail schema validation.
    pub fn on_json(&self, hook: impl Fn(&Value) + Send + Sync + 'static) {
        *self.inner.hooks.on_json.lock() = Some(Arc::new(hook));
    }

    /// Registers the hook for binary inbound frames.
    pub fn on_binary(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.hooks.on_binary.lock() = Some(Arc::new(hook));
    }

    /// Registers the hook for notifications with neither a topic nor a
    /// matching request.
    pub fn on_notification(&self, hook: impl Fn(&Value) + Send + Sync + 'static) {
        *self.inner.hooks.on_notification.lock() = Some(Arc::new(hook));
    }

    /// Observes one bus event by name.
    pub fn on_event(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.bus.on(name, callback)
    }

    /// Observes every bus event.
    pub fn on_any_event(
        &self,
        callback: impl Fn(&BusEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.bus.on_any(callback)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns `true` while the socket is open.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The configured server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Number of frames waiting in the send buffer.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Reconnection metrics snapshot.
    #[must_use]
    pub fn reconnection_metrics(&self) -> ReconnectionMetrics {
        self.inner.reconnect.metrics()
    }

    /// State-manager metrics snapshot.
    #[must_use]
    pub fn state_metrics(&self) -> StateMetrics {
        self.inner.state_manager.metrics()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn build_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.inner.url)
            .map_err(|err| Error::connection(format!("invalid url: {err}")))?;
        if let Some(token) = self.inner.state_manager.token() {
            url.query_pairs_mut().append_pair("recover", &token);
        }
        Ok(url.to_string())
    }

    fn fail_connect(&self) {
        *self.inner.state.lock() = ConnectionState::Disconnected;
        let last = *self.inner.last_connected_ms.lock();
        self.inner.bus.emit(&BusEvent::Disconnected {
            last_connected_ms: last,
            code: None,
            reason: None,
        });
        if self.inner.options.reconnect {
            self.inner.reconnect.start();
        }
    }
}

impl fmt::Debug for Starling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Starling")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .field("buffer_len", &self.buffer_len())
            .finish()
    }
}

// ============================================================================
// Send Path Internals
// ============================================================================

fn send_text(inner: &Arc<ClientInner>, text: String) {
    if *inner.state.lock() == ConnectionState::Connected {
        let tx = inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.command_tx.clone());
        if let Some(tx) = tx {
            match tx.send(LoopCommand::Send { text }) {
                Ok(()) => return,
                Err(err) => {
                    // Session died under us; fall through to the buffer.
                    let LoopCommand::Send { text } = err.0 else {
                        return;
                    };
                    inner.buffer.lock().add(text);
                    return;
                }
            }
        }
    }
    inner.buffer.lock().add(text);
}

fn send_frame(inner: &Arc<ClientInner>, frame: &Frame) {
    match codec::encode(frame) {
        Ok(text) => send_text(inner, text),
        Err(err) => error!(error = %err, "frame serialization failed"),
    }
}

fn response_sink(inner: &Arc<ClientInner>) -> ResponseSink {
    let weak = Arc::downgrade(inner);
    Arc::new(move |frame| {
        if let Some(inner) = weak.upgrade() {
            send_frame(&inner, &frame);
        }
    })
}

// ============================================================================
// Event Loop
// ============================================================================

async fn run_event_loop(
    weak: Weak<ClientInner>,
    mut sink: WsSink,
    mut stream: WsStream,
    mut command_rx: mpsc::UnboundedReceiver<LoopCommand>,
) {
    if let Some(inner) = weak.upgrade() {
        flush_buffer(&inner, &mut sink).await;
    }

    let mut close_code: Option<u16> = None;
    let mut close_reason: Option<String> = None;

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = Some(frame.code.into());
                        let reason = frame.reason.to_string();
                        if !reason.is_empty() {
                            close_reason = Some(reason);
                        }
                    }
                    debug!(code = ?close_code, "websocket closed by peer");
                    break;
                }

                Some(Ok(message)) => {
                    let Some(inner) = weak.upgrade() else { break };
                    handle_incoming(&inner, &message);
                }

                Some(Err(err)) => {
                    error!(error = %err, "websocket error");
                    if let Some(inner) = weak.upgrade() {
                        inner.bus.emit(&BusEvent::SocketError {
                            message: err.to_string(),
                        });
                    }
                    break;
                }

                None => {
                    debug!("websocket stream ended");
                    break;
                }
            },

            command = command_rx.recv() => match command {
                Some(LoopCommand::Send { text }) => {
                    if let Err(err) = sink.send(Message::Text(text.clone().into())).await {
                        warn!(error = %err, "write failed, frame rebuffered");
                        if let Some(inner) = weak.upgrade() {
                            inner.buffer.lock().add(text);
                        }
                    }
                }

                Some(LoopCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }

                None => {
                    debug!("command channel closed");
                    break;
                }
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        finish_session(&inner, close_code, close_reason);
    }
}

async fn flush_buffer(inner: &Arc<ClientInner>, sink: &mut WsSink) {
    let entries = inner.buffer.lock().drain();
    if entries.is_empty() {
        return;
    }

    let mut flushed = 0usize;
    let mut retained = Vec::new();

    for mut entry in entries {
        match sink.send(Message::Text(entry.content.clone().into())).await {
            Ok(()) => {
                entry.attempts += 1;
                flushed += 1;
            }
            Err(err) => {
                warn!(error = %err, "flush write failed, frame retained");
                retained.push(entry);
            }
        }
    }

    let retained_count = retained.len();
    let mut buffer = inner.buffer.lock();
    buffer.restore(retained);
    buffer.record_flush(flushed, retained_count);
}

fn finish_session(inner: &Arc<ClientInner>, code: Option<u16>, reason: Option<String>) {
    let was_closing = {
        let mut state = inner.state.lock();
        let was_closing = *state == ConnectionState::Closing;
        *state = ConnectionState::Disconnected;
        was_closing
    };
    inner.session.lock().take();

    let last = *inner.last_connected_ms.lock();
    inner.bus.emit(&BusEvent::Disconnected {
        last_connected_ms: last,
        code,
        reason,
    });
    debug!(was_closing, "session finished");

    if !was_closing && inner.options.reconnect {
        inner.reconnect.start();
    }
}

// ============================================================================
// Inbound Routing
// ============================================================================

fn handle_incoming(inner: &Arc<ClientInner>, message: &Message) {
    let Some(decoded) = codec::decode(message) else {
        return;
    };

    match decoded {
        Decoded::Valid(frame) => route_frame(inner, *frame),

        Decoded::InvalidJson { value, reason } => {
            warn!(reason = %reason, "invalid frame discarded");
            let hook = inner.hooks.on_json.lock().clone();
            if let Some(hook) = hook {
                hook(&value);
            }
            inner.bus.emit(&BusEvent::MessageInvalid { reason });
        }

        Decoded::Text(text) => {
            trace!("non-protocol text frame");
            let hook = inner.hooks.on_text.lock().clone();
            if let Some(hook) = hook {
                hook(&text);
            }
        }

        Decoded::Binary(bytes) => {
            let hook = inner.hooks.on_binary.lock().clone();
            if let Some(hook) = hook {
                hook(&bytes);
            }
        }
    }
}

fn route_frame(inner: &Arc<ClientInner>, frame: Frame) {
    let timestamp = frame.timestamp;

    match frame.body {
        FrameBody::Request(body) => {
            inner.bus.emit(&BusEvent::MessageRequest {
                method: body.method.clone(),
                request_id: body.request_id,
            });
            inner.methods.dispatch(body, timestamp, response_sink(inner));
        }

        FrameBody::Response(body) => {
            inner.bus.emit(&BusEvent::MessageResponse {
                request_id: body.request_id,
                success: body.success,
            });
            let delivered = if body.success {
                inner
                    .requests
                    .complete(body.request_id, body.data.unwrap_or(Value::Null))
            } else {
                let error = body
                    .error
                    .unwrap_or_else(|| ErrorObject::new("REQUEST_FAILED", "request failed"));
                inner.requests.fail(body.request_id, error)
            };
            if !delivered {
                trace!(request_id = %body.request_id, "late response dropped");
            }
        }

        FrameBody::Error(body) => {
            if let Some(id) = body.request_id
                && inner.requests.fail(id, body.error.clone())
            {
                return;
            }
            warn!(code = %body.error.code, "uncorrelated error frame");
            inner.bus.emit(&BusEvent::MessageError { error: body.error });
        }

        FrameBody::Notification(body) => {
            let notification = body.notification;
            inner.bus.emit(&BusEvent::MessageNotification {
                topic: notification.topic.clone(),
                request_id: notification.request_id,
            });

            let data = notification.data.clone().unwrap_or(Value::Null);
            if let Some(id) = notification.request_id
                && inner.requests.deliver_progress(id, &data)
            {
                return;
            }
            if let Some(topic) = &notification.topic {
                inner.topics.dispatch(topic, data, timestamp);
                return;
            }

            let hook = inner.hooks.on_notification.lock().clone();
            if let Some(hook) = hook {
                let raw = serde_json::to_value(&notification).unwrap_or(Value::Null);
                hook(&raw);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
