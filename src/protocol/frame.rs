//! Protocol frame types.
//!
//! Defines the message format exchanged between client and server.
//! See PROTOCOL.md Section 2 for the frame specification.
//!
//! # Frame Kinds
//!
//! | Kind | Direction | Purpose |
//! |------|-----------|---------|
//! | `request` | Both | Method invocation |
//! | `response` | Both | Result of a request |
//! | `notification` | Both | Topic broadcast or request progress |
//! | `error` | Both | Structured failure, optionally correlated |

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorObject;
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Protocol name advertised on every outbound frame.
pub const PROTOCOL_NAME: &str = "helios-starling";

/// Protocol version advertised on every outbound frame.
pub const PROTOCOL_VERSION: &str = "1.0.0";

// ============================================================================
// Time
// ============================================================================

/// Current time as integer milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Frame
// ============================================================================

/// A single protocol message on the wire.
///
/// # Format
///
/// ```json
/// {
///   "protocol": "helios-starling",
///   "version": "1.0.0",
///   "timestamp": 1700000000000,
///   "type": "request",
///   "requestId": "uuid",
///   "method": "user:profile",
///   "payload": { ... }
/// }
/// ```
///
/// The `protocol` field is stamped on every outbound frame but tolerated
/// missing on inbound frames for backward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol name; always [`PROTOCOL_NAME`] outbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Protocol version (`MAJOR.MINOR.PATCH`).
    pub version: String,

    /// Milliseconds since the Unix epoch; always positive.
    pub timestamp: u64,

    /// Type-specific fields, discriminated by the `type` field.
    #[serde(flatten)]
    pub body: FrameBody,
}

impl Frame {
    fn envelope(body: FrameBody) -> Self {
        Self {
            protocol: Some(PROTOCOL_NAME.to_string()),
            version: PROTOCOL_VERSION.to_string(),
            timestamp: now_ms(),
            body,
        }
    }

    /// Builds a request frame with the envelope stamped.
    #[must_use]
    pub fn request(
        request_id: RequestId,
        method: impl Into<String>,
        payload: Option<Value>,
        options: Option<Value>,
    ) -> Self {
        Self::envelope(FrameBody::Request(RequestBody {
            request_id,
            method: method.into(),
            payload,
            options,
        }))
    }

    /// Builds a success response frame.
    #[must_use]
    pub fn response_success(request_id: RequestId, data: Value) -> Self {
        Self::envelope(FrameBody::Response(ResponseBody {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }))
    }

    /// Builds a failure response frame.
    #[must_use]
    pub fn response_failure(request_id: RequestId, error: ErrorObject) -> Self {
        Self::envelope(FrameBody::Response(ResponseBody {
            request_id,
            success: false,
            data: None,
            error: Some(error),
        }))
    }

    /// Builds a topic-scoped notification frame.
    #[must_use]
    pub fn notification(topic: impl Into<String>, data: Value) -> Self {
        Self::envelope(FrameBody::Notification(NotificationBody {
            notification: Notification {
                request_id: None,
                topic: Some(topic.into()),
                data: Some(data),
            },
        }))
    }

    /// Builds a request-scoped progress notification frame.
    #[must_use]
    pub fn progress(request_id: RequestId, data: Value) -> Self {
        Self::envelope(FrameBody::Notification(NotificationBody {
            notification: Notification {
                request_id: Some(request_id),
                topic: None,
                data: Some(data),
            },
        }))
    }

    /// Builds an error frame, optionally correlated to a request.
    #[must_use]
    pub fn error(error: ErrorObject, request_id: Option<RequestId>) -> Self {
        Self::envelope(FrameBody::Error(ErrorBody { error, request_id }))
    }

    /// The frame kind as it appears in the `type` field.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.body {
            FrameBody::Request(_) => "request",
            FrameBody::Response(_) => "response",
            FrameBody::Notification(_) => "notification",
            FrameBody::Error(_) => "error",
        }
    }

    /// The request ID carried by this frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.body {
            FrameBody::Request(body) => Some(body.request_id),
            FrameBody::Response(body) => Some(body.request_id),
            FrameBody::Notification(body) => body.notification.request_id,
            FrameBody::Error(body) => body.request_id,
        }
    }
}

// ============================================================================
// FrameBody
// ============================================================================

/// Type-specific frame content, tagged by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameBody {
    /// Method invocation.
    Request(RequestBody),
    /// Result of a request.
    Response(ResponseBody),
    /// Topic broadcast or request progress.
    Notification(NotificationBody),
    /// Structured failure.
    Error(ErrorBody),
}

// ============================================================================
// RequestBody
// ============================================================================

/// Fields of a `request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Correlation ID (UUID v4).
    #[serde(rename = "requestId")]
    pub request_id: RequestId,

    /// Method name in `namespace:method` format.
    pub method: String,

    /// Arbitrary JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Caller-supplied options forwarded to the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

// ============================================================================
// ResponseBody
// ============================================================================

/// Fields of a `response` frame.
///
/// Exactly one of `data` (success) or `error` (failure) is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// ID of the request being answered.
    #[serde(rename = "requestId")]
    pub request_id: RequestId,

    /// Whether the request succeeded.
    pub success: bool,

    /// Result data (success only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Failure description (failure only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

// ============================================================================
// NotificationBody
// ============================================================================

/// Fields of a `notification` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationBody {
    /// The notification content.
    pub notification: Notification,
}

/// Notification content.
///
/// Two recognized shapes: topic-scoped (`topic` set) for server broadcast,
/// and request-scoped (`requestId` set) for progress on a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Pending request this notification belongs to, if request-scoped.
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<RequestId>,

    /// Topic name, if topic-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Notification data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// ErrorBody
// ============================================================================

/// Fields of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The structured error.
    pub error: ErrorObject,

    /// Correlated request, if the error refers to one.
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<RequestId>,
}

// ============================================================================
// Tests
// ============================================================================
