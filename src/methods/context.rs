//! Per-call context handed to method handlers.
//!
//! A [`RequestContext`] is the handler's only way to answer the peer:
//! exactly one of [`success`](RequestContext::success) or
//! [`error`](RequestContext::error) may be called, at most once total.
//! [`notify`](RequestContext::notify) streams progress notifications any
//! number of times while the context is unfinished.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::{Error, ErrorObject, Result};
use crate::identifiers::RequestId;
use crate::protocol::frame::Frame;

// ============================================================================
// ResponseSink
// ============================================================================

/// Where context-produced frames go; the client routes them through its
/// normal send path (buffering included).
pub(crate) type ResponseSink = Arc<dyn Fn(Frame) + Send + Sync>;

// ============================================================================
// RequestContext
// ============================================================================

/// Context of one inbound method call.
///
/// Cheap to clone; clones share the terminal flag.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: RequestId,
    payload: Value,
    timestamp: u64,
    options: Option<Value>,
    finished: AtomicBool,
    sink: ResponseSink,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        payload: Option<Value>,
        timestamp: u64,
        options: Option<Value>,
        sink: ResponseSink,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id,
                payload: payload.unwrap_or(Value::Null),
                timestamp,
                options,
                finished: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// The inbound request's correlation ID.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    /// The request payload; `null` when the frame carried none.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// The request frame's timestamp, milliseconds since epoch.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.inner.timestamp
    }

    /// Caller-supplied wire options, if any.
    #[inline]
    #[must_use]
    pub fn options(&self) -> Option<&Value> {
        self.inner.options.as_ref()
    }

    /// Returns `true` once a terminal response has been sent.
    #[inline]
    #[must_use]
    pub fn finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Sends a success response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextAlreadyFinished`] if a terminal response was
    /// already sent.
    pub fn success(&self, data: Value) -> Result<()> {
        self.finish()?;
        (self.inner.sink)(Frame::response_success(self.inner.request_id, data));
        Ok(())
    }

    /// Sends a failure response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextAlreadyFinished`] if a terminal response was
    /// already sent.
    pub fn error(&self, code: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.error_object(ErrorObject::new(code, message))
    }

    /// Sends a failure response from a prebuilt error object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextAlreadyFinished`] if a terminal response was
    /// already sent.
    pub fn error_object(&self, error: ErrorObject) -> Result<()> {
        self.finish()?;
        (self.inner.sink)(Frame::response_failure(self.inner.request_id, error));
        Ok(())
    }

    /// Streams a progress notification correlated to this request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextAlreadyFinished`] once the context is
    /// finished.
    pub fn notify(&self, data: Value) -> Result<()> {
        if self.finished() {
            return Err(Error::ContextAlreadyFinished);
        }
        (self.inner.sink)(Frame::progress(self.inner.request_id, data));
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.inner
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::ContextAlreadyFinished)?;
        Ok(())
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.inner.request_id)
            .field("timestamp", &self.inner.timestamp)
            .field("finished", &self.finished())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
