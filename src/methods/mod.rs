//! Inbound method registry and dispatch.
//!
//! Applications register methods the server can invoke on them. Dispatch
//! races each handler against a per-method timeout and answers the peer
//! through the handler's [`RequestContext`].
//!
//! # Name Rules
//!
//! | Rule | Rejection |
//! |------|-----------|
//! | Length ≥ 3 | `INVALID_METHOD_NAME` |
//! | `^[a-zA-Z][\w:]*$` | `INVALID_METHOD_NAME` |
//! | Namespace not reserved | `NAME_RESERVED` |
//! | Unique per connection | `METHOD_EXISTS` |
//!
//! The namespace is the prefix before the first `:`, or the whole name when
//! there is none. Reserved namespaces are server-owned: `system`,
//! `internal`, `stream`, `helios`.

// ============================================================================
// Submodules
// ============================================================================

/// Per-call context handed to method handlers.
pub mod context;

pub use context::RequestContext;
pub(crate) use context::ResponseSink;

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{Error, ErrorObject, Result};
use crate::protocol::codec::MIN_METHOD_LEN;
use crate::protocol::frame::{Frame, RequestBody};

// ============================================================================
// Constants
// ============================================================================

/// Namespaces owned by the server, rejected at registration.
pub const RESERVED_NAMESPACES: [&str; 4] = ["system", "internal", "stream", "helios"];

/// Namespace of the protocol's own RPCs, also rejected at registration.
pub const PROTOCOL_NAMESPACE: &str = "starling";

/// Default per-method handler timeout.
pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(30);

/// Registration grammar. Stricter than the wire grammar: no dots.
static METHOD_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][\w:]*$").expect("method name pattern compiles"));

// ============================================================================
// MethodOptions
// ============================================================================

/// Options for [`MethodRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    /// Handler timeout; defaults to [`DEFAULT_METHOD_TIMEOUT`].
    pub timeout: Option<Duration>,
}

// ============================================================================
// Types
// ============================================================================

type MethodHandler = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct RegisteredMethod {
    handler: MethodHandler,
    timeout: Duration,
}

// ============================================================================
// Name Validation
// ============================================================================

/// Checks a method name against the registration rules.
///
/// # Errors
///
/// Returns [`Error::InvalidMethodName`] or [`Error::NameReserved`].
pub fn validate_method_name(name: &str) -> Result<()> {
    if name.len() < MIN_METHOD_LEN {
        return Err(Error::invalid_method_name(
            name,
            format!("must be at least {MIN_METHOD_LEN} characters"),
        ));
    }

    if !METHOD_NAME_RE.is_match(name) {
        return Err(Error::invalid_method_name(
            name,
            "must start with a letter and contain only word characters and ':'",
        ));
    }

    let namespace = name.split(':').next().unwrap_or(name);
    if RESERVED_NAMESPACES.contains(&namespace) {
        return Err(Error::name_reserved(name, namespace));
    }
    // The protocol's own RPCs (starling:state) are callable but never
    // registrable.
    if namespace == PROTOCOL_NAMESPACE {
        return Err(Error::name_reserved(name, namespace));
    }

    Ok(())
}

// ============================================================================
// MethodRegistry
// ============================================================================

/// Registry of client-side methods the server can invoke.
#[derive(Default)]
pub struct MethodRegistry {
    methods: Mutex<FxHashMap<String, RegisteredMethod>>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMethodName`], [`Error::NameReserved`], or
    /// [`Error::MethodExists`].
    pub fn register<F, Fut>(&self, name: &str, handler: F, options: MethodOptions) -> Result<()>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        validate_method_name(name)?;

        let mut methods = self.methods.lock();
        if methods.contains_key(name) {
            return Err(Error::method_exists(name));
        }

        methods.insert(
            name.to_string(),
            RegisteredMethod {
                handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
                timeout: options.timeout.unwrap_or(DEFAULT_METHOD_TIMEOUT),
            },
        );
        debug!(method = name, "method registered");
        Ok(())
    }

    /// Dispatches an inbound request frame.
    ///
    /// Unknown methods are answered with a `METHOD_NOT_FOUND` failure
    /// response. Known methods run on a spawned task, raced against their
    /// timeout; a handler error or timeout produces a `METHOD_ERROR`
    /// failure response unless the handler already finished the context.
    pub(crate) fn dispatch(&self, body: RequestBody, timestamp: u64, sink: ResponseSink) {
        let entry = {
            let methods = self.methods.lock();
            methods
                .get(&body.method)
                .map(|m| (Arc::clone(&m.handler), m.timeout))
        };

        let Some((handler, timeout)) = entry else {
            warn!(method = %body.method, "request for unknown method");
            sink(Frame::response_failure(
                body.request_id,
                ErrorObject::new(
                    "METHOD_NOT_FOUND",
                    format!("Method '{}' not found", body.method),
                ),
            ));
            return;
        };

        let ctx = RequestContext::new(
            body.request_id,
            body.payload,
            timestamp,
            body.options,
            sink,
        );
        let ctx_after = ctx.clone();
        let method = body.method;
        let fut = handler(ctx);

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(method = %method, error = %err, "method handler failed");
                    if !ctx_after.finished() {
                        let _ = ctx_after.error("METHOD_ERROR", err.to_string());
                    }
                }
                Err(_) => {
                    warn!(method = %method, timeout_ms = timeout.as_millis() as u64, "method handler timed out");
                    if !ctx_after.finished() {
                        let _ = ctx_after.error("METHOD_ERROR", "Method timeout");
                    }
                }
            }
        });
    }

    /// Returns `true` if a method with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.lock().contains_key(name)
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.lock().len()
    }

    /// Returns `true` if no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::RequestId;
    use crate::protocol::frame::FrameBody;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    fn capture_sink() -> (ResponseSink, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: ResponseSink = Arc::new(move |frame| {
            let _ = tx.send(frame);
        });
        (sink, rx)
    }

    fn request_body(method: &str, payload: Value) -> RequestBody {
        RequestBody {
            request_id: RequestId::generate(),
            method: method.to_string(),
            payload: Some(payload),
            options: None,
        }
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_method_name("user:profile").is_ok());
        assert!(validate_method_name("abc").is_ok());
        assert!(validate_method_name("starlingLike:thing").is_ok());

        for bad in ["ab", "1abc", "a-b"] {
            let err = validate_method_name(bad).expect_err("should reject");
            assert_eq!(err.code(), "INVALID_METHOD_NAME", "name '{bad}'");
        }
    }

    #[test]
    fn test_reserved_namespaces() {
        for name in ["system:x", "internal:reset", "stream:open", "helios:ping"] {
            let err = validate_method_name(name).expect_err("should reject");
            assert_eq!(err.code(), "NAME_RESERVED", "name '{name}'");
        }
        // Whole name counts as the namespace when there is no colon.
        assert_eq!(
            validate_method_name("system").expect_err("bare").code(),
            "NAME_RESERVED"
        );
        // The protocol's own namespace is callable but not registrable.
        assert_eq!(
            validate_method_name("starling:state")
                .expect_err("protocol namespace")
                .code(),
            "NAME_RESERVED"
        );
        // Reserved words inside a different namespace are fine.
        assert!(validate_method_name("app:system").is_ok());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = MethodRegistry::new();
        registry
            .register("app:ping", |ctx| async move { ctx.success(json!(1)) }, MethodOptions::default())
            .expect("first registration");

        let err = registry
            .register("app:ping", |ctx| async move { ctx.success(json!(2)) }, MethodOptions::default())
            .expect_err("duplicate");
        assert_eq!(err.code(), "METHOD_EXISTS");
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let registry = MethodRegistry::new();
        registry
            .register(
                "super:echo",
                |ctx| async move { ctx.success(json!({"success": true})) },
                MethodOptions::default(),
            )
            .expect("register");

        let (sink, mut rx) = capture_sink();
        let body = request_body("super:echo", json!({}));
        let id = body.request_id;
        registry.dispatch(body, 1, sink);

        let frame = rx.recv().await.expect("response");
        match frame.body {
            FrameBody::Response(body) => {
                assert_eq!(body.request_id, id);
                assert!(body.success);
                assert_eq!(body.data, Some(json!({"success": true})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let registry = MethodRegistry::new();
        let (sink, mut rx) = capture_sink();
        let body = request_body("ghost", json!({}));
        let id = body.request_id;
        registry.dispatch(body, 1, sink);

        let frame = rx.recv().await.expect("error response");
        match frame.body {
            FrameBody::Response(body) => {
                assert_eq!(body.request_id, id);
                assert!(!body.success);
                assert_eq!(body.error.expect("error").code, "METHOD_NOT_FOUND");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_method_error() {
        let registry = MethodRegistry::new();
        registry
            .register(
                "app:explode",
                |_ctx| async move { Err(Error::connection("inner failure")) },
                MethodOptions::default(),
            )
            .expect("register");

        let (sink, mut rx) = capture_sink();
        registry.dispatch(request_body("app:explode", json!({})), 1, sink);

        let frame = rx.recv().await.expect("error response");
        match frame.body {
            FrameBody::Response(body) => {
                let error = body.error.expect("error");
                assert_eq!(error.code, "METHOD_ERROR");
                assert!(error.message.contains("inner failure"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_becomes_method_error() {
        let registry = MethodRegistry::new();
        registry
            .register(
                "app:stall",
                |_ctx| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                MethodOptions {
                    timeout: Some(Duration::from_millis(100)),
                },
            )
            .expect("register");

        let (sink, mut rx) = capture_sink();
        registry.dispatch(request_body("app:stall", json!({})), 1, sink);

        let frame = rx.recv().await.expect("error response");
        match frame.body {
            FrameBody::Response(body) => {
                let error = body.error.expect("error");
                assert_eq!(error.code, "METHOD_ERROR");
                assert_eq!(error.message, "Method timeout");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_second_response_after_handler_finished() {
        let registry = MethodRegistry::new();
        registry
            .register(
                "app:slowok",
                |ctx| async move {
                    ctx.success(json!("early"))?;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                MethodOptions {
                    timeout: Some(Duration::from_millis(100)),
                },
            )
            .expect("register");

        let (sink, mut rx) = capture_sink();
        registry.dispatch(request_body("app:slowok", json!({})), 1, sink);

        let frame = rx.recv().await.expect("response");
        assert!(matches!(frame.body, FrameBody::Response(body) if body.success));
        // The timeout fires, but the context is finished: no second frame.
        assert!(rx.recv().await.is_none() || rx.try_recv().is_err());
    }
}
