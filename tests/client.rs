//! End-to-end client tests over an in-memory transport.
//!
//! The fake transport records every connect URL and written frame and lets
//! tests inject server frames or drop the connection. Timer-sensitive
//! scenarios run under a paused clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;

use starling_client::{
    Error, MethodOptions, ReconnectOptions, RequestOptions, Result, Starling, StateOptions,
    Transport, TransportStream,
};

// ============================================================================
// Fake Transport
// ============================================================================

type ServerTx = tokio::sync::mpsc::UnboundedSender<std::result::Result<Message, WsError>>;

struct FakeShared {
    urls: Vec<String>,
    refusals: VecDeque<()>,
    current_tx: Option<ServerTx>,
}

struct FakeTransport {
    shared: Mutex<FakeShared>,
    writes: Arc<Mutex<Vec<Message>>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(FakeShared {
                urls: Vec::new(),
                refusals: VecDeque::new(),
                current_tx: None,
            }),
            writes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Makes the next `count` connect calls fail.
    fn refuse_next(&self, count: usize) {
        let mut shared = self.shared.lock();
        for _ in 0..count {
            shared.refusals.push_back(());
        }
    }

    fn urls(&self) -> Vec<String> {
        self.shared.lock().urls.clone()
    }

    fn connect_count(&self) -> usize {
        self.shared.lock().urls.len()
    }

    /// Frames the client wrote, parsed as JSON.
    fn written_frames(&self) -> Vec<Value> {
        self.writes
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
                _ => None,
            })
            .collect()
    }

    /// Sends a JSON frame from the fake server to the client.
    fn inject(&self, value: Value) {
        self.inject_message(Message::Text(value.to_string().into()));
    }

    fn inject_message(&self, message: Message) {
        let tx = self
            .shared
            .lock()
            .current_tx
            .clone()
            .expect("no live connection to inject into");
        tx.send(Ok(message)).expect("client stream gone");
    }

    /// Drops the server side of the connection.
    fn drop_connection(&self) {
        self.shared.lock().current_tx.take();
    }
}

impl Transport for FakeTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportStream>> {
        let result = {
            let mut shared = self.shared.lock();
            shared.urls.push(url.to_string());
            if shared.refusals.pop_front().is_some() {
                Err(Error::connection("connection refused"))
            } else {
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                shared.current_tx = Some(tx);

                let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });

                let writes = Arc::clone(&self.writes);
                let sink = futures_util::sink::unfold((), move |(), message: Message| {
                    let writes = Arc::clone(&writes);
                    async move {
                        writes.lock().push(message);
                        Ok::<(), WsError>(())
                    }
                });

                Ok(TransportStream {
                    sink: Box::pin(sink),
                    stream: Box::pin(stream),
                })
            }
        };
        Box::pin(async move { result })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn build_client(transport: &Arc<FakeTransport>, reconnect: bool) -> Starling {
    Starling::builder("ws://localhost:9000/ws")
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .reconnect(reconnect)
        .state_options(StateOptions {
            force_refresh_on_reconnect: false,
            ..Default::default()
        })
        .build()
        .expect("build client")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_frame(
    transport: &Arc<FakeTransport>,
    mut predicate: impl FnMut(&Value) -> bool,
) -> Value {
    let mut found = None;
    let t = Arc::clone(transport);
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if let Some(frame) = t.written_frames().iter().find(|f| predicate(f)) {
                found = Some(frame.clone());
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame not written in time");
    found.expect("frame")
}

/// Answers the next `starling:state` request with the given token.
async fn answer_sync(transport: &Arc<FakeTransport>, token: &str) {
    let request = wait_for_frame(transport, |f| f["method"] == "starling:state").await;
    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 2,
        "type": "response",
        "requestId": request["requestId"],
        "success": true,
        "data": {"token": token}
    }));
}

// ============================================================================
// S1 — Echo Request/Response
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s1_echo_request_response() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);

    client
        .register_method(
            "super:echo",
            |ctx| async move { ctx.success(json!({"success": true})) },
            MethodOptions::default(),
        )
        .expect("register");

    client.connect().await.expect("connect");

    transport.inject(json!({
        "type": "request",
        "requestId": "00000000-0000-4000-8000-000000000001",
        "method": "super:echo",
        "payload": {},
        "version": "1.0.0",
        "timestamp": 1,
        "protocol": "helios-starling"
    }));

    let response = wait_for_frame(&transport, |f| f["type"] == "response").await;
    assert_eq!(
        response["requestId"],
        "00000000-0000-4000-8000-000000000001"
    );
    assert_eq!(response["success"], true);
    assert_eq!(response["data"], json!({"success": true}));
}

// ============================================================================
// S2 — Unknown Method
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s2_unknown_method() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);
    client.connect().await.expect("connect");

    transport.inject(json!({
        "type": "request",
        "requestId": "00000000-0000-4000-8000-000000000002",
        "method": "ghost",
        "version": "1.0.0",
        "timestamp": 1,
        "protocol": "helios-starling"
    }));

    let response = wait_for_frame(&transport, |f| f["type"] == "response").await;
    assert_eq!(
        response["requestId"],
        "00000000-0000-4000-8000-000000000002"
    );
    assert_eq!(response["success"], false);
    assert_eq!(response["error"]["code"], "METHOD_NOT_FOUND");
}

// ============================================================================
// S3 — Buffered Send
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s3_buffered_notifications_flush_in_order() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);

    for i in 1..=5 {
        client.notify("ping", json!({"x": i})).expect("notify");
    }
    assert_eq!(client.buffer_len(), 5);

    client.connect().await.expect("connect");
    wait_until(|| transport.written_frames().len() >= 5).await;

    let notifications: Vec<Value> = transport
        .written_frames()
        .into_iter()
        .filter(|f| f["type"] == "notification")
        .collect();
    assert_eq!(notifications.len(), 5);
    for (index, frame) in notifications.iter().enumerate() {
        assert_eq!(frame["notification"]["topic"], "ping");
        assert_eq!(frame["notification"]["data"]["x"], (index as u64) + 1);
    }
    assert_eq!(client.buffer_len(), 0);
}

// ============================================================================
// S4 — Reconnect With Recovery Token
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s4_reconnect_attempts_carry_recovery_token() {
    let transport = FakeTransport::new();
    let client = Starling::builder("ws://localhost:9000/ws")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .reconnect(true)
        .reconnect_options(ReconnectOptions {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(30),
            backoff_multiplier: 2.0,
            max_attempts: Some(3),
            reset_threshold: Duration::from_secs(60),
        })
        .state_options(StateOptions {
            force_refresh_on_reconnect: false,
            ..Default::default()
        })
        .build()
        .expect("build");

    client.connect().await.expect("connect");

    // Obtain a recovery token via sync().
    let sync_task = {
        let client = client.clone();
        tokio::spawn(async move { client.sync().await })
    };
    answer_sync(&transport, "TOK").await;
    let token = sync_task.await.expect("join").expect("sync");
    assert_eq!(token, "TOK");
    assert_eq!(client.recovery_token(), Some("TOK".to_string()));

    // Every reconnection attempt must fail.
    transport.refuse_next(100);
    let capped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&capped);
    let _listener = client.on_event("starling:reconnect:max_attempts", move |_| {
        flag.store(true, Ordering::SeqCst);
    });

    let before = transport.connect_count();
    transport.drop_connection();
    wait_until(|| capped.load(Ordering::SeqCst)).await;

    let urls = transport.urls();
    let attempts = &urls[before..];
    assert_eq!(attempts.len(), 3, "exactly three attempted opens");
    for url in attempts {
        assert!(url.contains("recover=TOK"), "url missing token: {url}");
    }

    let metrics = client.reconnection_metrics();
    assert_eq!(metrics.failed_attempts, 3);
    assert_eq!(metrics.successful_reconnections, 0);
}

// ============================================================================
// S5 — Request Timeout With Late Reply
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s5_request_timeout_then_late_reply_dropped() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);
    client.connect().await.expect("connect");

    let handle = client
        .request(
            "slow",
            Some(json!({})),
            RequestOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .expect("request");
    let id = handle.id();

    let started = tokio::time::Instant::now();
    let err = handle.await.expect_err("should time out");
    assert_eq!(err.code(), "REQUEST_TIMEOUT");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_requests(), 0);

    // A response arriving at t=200ms hits an empty table and is dropped.
    tokio::time::sleep(Duration::from_millis(150)).await;
    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 200,
        "type": "response",
        "requestId": id.to_string(),
        "success": true,
        "data": "late"
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(client.pending_requests(), 0);
    assert!(client.connected());
}

// ============================================================================
// S6 — Progress Stream
// ============================================================================

#[tokio::test(start_paused = true)]
async fn s6_progress_stream_then_resolution() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);
    client.connect().await.expect("connect");

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let handle = client
        .request("download", Some(json!({"file": "big.bin"})), RequestOptions::default())
        .expect("request")
        .on_progress(move |value| seen.lock().push(value.clone()));
    let id = handle.id().to_string();

    for percent in [50, 100] {
        transport.inject(json!({
            "protocol": "helios-starling",
            "version": "1.0.0",
            "timestamp": 3,
            "type": "notification",
            "notification": {"requestId": id, "data": {"percent": percent}}
        }));
    }
    wait_until(|| progress.lock().len() == 2).await;

    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 4,
        "type": "response",
        "requestId": id,
        "success": true,
        "data": {"bytes": 1024}
    }));
    let data = handle.await.expect("resolve");
    assert_eq!(data, json!({"bytes": 1024}));

    // Progress after resolution is dropped.
    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 5,
        "type": "notification",
        "notification": {"requestId": id, "data": {"percent": 999}}
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let seen = progress.lock();
    assert_eq!(
        *seen,
        vec![json!({"percent": 50}), json!({"percent": 100})]
    );
}

// ============================================================================
// Refresh Throttle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sync_twice_within_min_interval_rejected() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);
    client.connect().await.expect("connect");

    let sync_task = {
        let client = client.clone();
        tokio::spawn(async move { client.sync().await })
    };
    answer_sync(&transport, "TOK").await;
    sync_task.await.expect("join").expect("first sync");

    let err = client.sync().await.expect_err("throttled");
    assert_eq!(err.code(), "MIN_INTERVAL_NOT_REACHED");
}

// ============================================================================
// Inbound Routing Fallbacks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn non_protocol_frames_reach_peek_hooks() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);

    let texts = Arc::new(Mutex::new(Vec::new()));
    let jsons = Arc::new(Mutex::new(Vec::new()));
    let binaries = Arc::new(Mutex::new(Vec::new()));
    let orphans = Arc::new(Mutex::new(Vec::new()));
    let invalids = Arc::new(Mutex::new(0usize));

    {
        let texts = Arc::clone(&texts);
        client.on_text(move |text| texts.lock().push(text.to_string()));
        let jsons = Arc::clone(&jsons);
        client.on_json(move |value| jsons.lock().push(value.clone()));
        let binaries = Arc::clone(&binaries);
        client.on_binary(move |bytes| binaries.lock().push(bytes.to_vec()));
        let orphans = Arc::clone(&orphans);
        client.on_notification(move |value| orphans.lock().push(value.clone()));
        let invalids = Arc::clone(&invalids);
        let _ = client.on_event("message:invalid", move |_| *invalids.lock() += 1);
    }

    client.connect().await.expect("connect");

    // Plain text.
    transport.inject_message(Message::Text("hello there".into()));
    // JSON that fails schema validation.
    transport.inject(json!({"version": "1.0.0", "timestamp": 1, "type": "heartbeat"}));
    // Binary.
    transport.inject_message(Message::Binary(vec![1, 2, 3].into()));
    // Notification with neither topic nor requestId.
    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 1,
        "type": "notification",
        "notification": {"data": {"stray": true}}
    }));

    wait_until(|| {
        texts.lock().len() == 1
            && jsons.lock().len() == 1
            && binaries.lock().len() == 1
            && orphans.lock().len() == 1
    })
    .await;

    assert_eq!(texts.lock()[0], "hello there");
    assert_eq!(binaries.lock()[0], vec![1, 2, 3]);
    assert_eq!(*invalids.lock(), 1);
    assert_eq!(orphans.lock()[0]["data"]["stray"], true);
}

// ============================================================================
// Topic Routing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn topic_notifications_reach_matching_subscribers() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = client
        .subscribe(
            "chat.*",
            move |event| sink.lock().push((event.topic, event.data)),
            Default::default(),
        )
        .expect("subscribe");

    client.connect().await.expect("connect");

    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 1,
        "type": "notification",
        "notification": {"topic": "chat.lobby", "data": {"text": "hi"}}
    }));
    transport.inject(json!({
        "protocol": "helios-starling",
        "version": "1.0.0",
        "timestamp": 2,
        "type": "notification",
        "notification": {"topic": "mail.inbox", "data": {}}
    }));

    wait_until(|| !events.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "chat.lobby");
    assert_eq!(events[0].1["text"], "hi");
}

// ============================================================================
// Disconnect Semantics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_and_clears_buffer() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);
    client.connect().await.expect("connect");

    let handle = client
        .request("slow", None, RequestOptions::default())
        .expect("request");

    client.notify("late.topic", json!(1)).expect("notify");
    client.disconnect(Some("shutting down")).await.expect("disconnect");

    let err = handle.await.expect_err("cancelled");
    assert_eq!(err.code(), "REQUEST_CANCELLED");
    assert!(err.to_string().contains("shutting down"));

    assert!(!client.connected());
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.buffer_len(), 0);

    // The close frame went out with code 1000.
    let close = transport
        .writes
        .lock()
        .iter()
        .find_map(|message| match message {
            Message::Close(Some(frame)) => Some((u16::from(frame.code), frame.reason.to_string())),
            _ => None,
        });
    assert_eq!(close, Some((1000, "shutting down".to_string())));
}

// ============================================================================
// Offline Request Without Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn offline_request_without_retry_fails_fast() {
    let transport = FakeTransport::new();
    let client = build_client(&transport, false);

    let handle = client
        .request(
            "user:profile",
            None,
            RequestOptions {
                retry: false,
                ..Default::default()
            },
        )
        .expect("request");

    let err = handle.await.expect_err("fails fast");
    assert_eq!(err.code(), "REQUEST_FAILED");
    assert_eq!(client.buffer_len(), 0);
}

// ============================================================================
// Reconnect Restores Service
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_after_drop_restores_connection() {
    let transport = FakeTransport::new();
    let client = Starling::builder("ws://localhost:9000/ws")
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .reconnect(true)
        .reconnect_options(ReconnectOptions {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 1.5,
            max_attempts: Some(10),
            reset_threshold: Duration::from_secs(60),
        })
        .state_options(StateOptions {
            force_refresh_on_reconnect: false,
            ..Default::default()
        })
        .build()
        .expect("build");

    client.connect().await.expect("connect");
    transport.refuse_next(2);
    transport.drop_connection();

    wait_until(|| transport.connect_count() >= 4 && client.connected()).await;

    let metrics = client.reconnection_metrics();
    assert_eq!(metrics.failed_attempts, 2);
    assert_eq!(metrics.successful_reconnections, 1);

    // The restored session is usable.
    client.notify("back.online", json!({})).expect("notify");
    wait_until(|| {
        transport
            .written_frames()
            .iter()
            .any(|f| f["notification"]["topic"] == "back.online")
    })
    .await;
}
