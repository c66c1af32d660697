//! Error types for the helios-starling client.
//!
//! Error codes follow PROTOCOL.md Section 5.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use starling_client::{Starling, Result};
//!
//! async fn example(client: &Starling) -> Result<()> {
//!     client.connect().await?;
//!     let data = client.request("user:profile", None, Default::default())?.await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Requests | [`Error::RequestTimeout`], [`Error::RequestCancelled`], [`Error::RequestFailed`], [`Error::TooManyRequests`] |
//! | Methods | [`Error::InvalidMethodName`], [`Error::NameReserved`], [`Error::MethodExists`], [`Error::ContextAlreadyFinished`] |
//! | Topics | [`Error::InvalidPattern`] |
//! | State | [`Error::RefreshInProgress`], [`Error::MinIntervalNotReached`], [`Error::StateRefreshFailed`] |
//! | Codec | [`Error::InvalidMessage`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// ErrorObject
// ============================================================================

/// Structured error as carried on the wire.
///
/// Appears in failure responses and error frames, and is handed to callers
/// when a request is rejected by the peer.
///
/// # Format
///
/// ```json
/// { "code": "METHOD_ERROR", "message": "boom", "details": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Machine-readable error code.
    pub code: String,

    /// Human-readable description.
    pub message: String,

    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorObject {
    /// Creates an error object without details.
    #[inline]
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Creates an error object with structured details.
    #[inline]
    #[must_use]
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. Wire codes match
/// PROTOCOL.md Section 5; see [`Error::code`].
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection could not be established or used.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Socket did not reach the connected state in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// No response arrived within the request timeout.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Request cancelled locally before a response arrived.
    #[error("Request cancelled: {reason}")]
    RequestCancelled {
        /// Cancellation reason.
        reason: String,
    },

    /// Peer answered the request with a failure response.
    #[error("Request failed: {error}")]
    RequestFailed {
        /// The structured error returned by the peer.
        error: ErrorObject,
    },

    /// The in-flight request table is full.
    #[error("Too many pending requests: {pending}/{max}")]
    TooManyRequests {
        /// Current number of pending requests.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Method Registration Errors
    // ========================================================================
    /// Method name fails the grammar or length rules.
    #[error("Invalid method name '{name}': {reason}")]
    InvalidMethodName {
        /// The rejected name.
        name: String,
        /// Which rule it broke.
        reason: String,
    },

    /// Method name lives in a reserved namespace.
    #[error("Method name '{name}' uses reserved namespace '{namespace}'")]
    NameReserved {
        /// The rejected name.
        name: String,
        /// The reserved namespace it collides with.
        namespace: String,
    },

    /// A method with this name is already registered.
    #[error("Method '{name}' already registered")]
    MethodExists {
        /// The duplicate name.
        name: String,
    },

    /// A request context was resolved more than once.
    #[error("Request context already finished")]
    ContextAlreadyFinished,

    // ========================================================================
    // Topic Errors
    // ========================================================================
    /// Topic pattern could not be compiled.
    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Which rule it broke.
        reason: String,
    },

    // ========================================================================
    // Codec Errors
    // ========================================================================
    /// Inbound frame failed protocol validation.
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        /// Why validation failed.
        reason: String,
    },

    // ========================================================================
    // State Errors
    // ========================================================================
    /// A token refresh is already running.
    #[error("State refresh already in progress")]
    RefreshInProgress,

    /// Non-forced refresh attempted before the minimum interval elapsed.
    #[error("Minimum refresh interval not reached ({remaining_ms}ms remaining)")]
    MinIntervalNotReached {
        /// Milliseconds until the next refresh is allowed.
        remaining_ms: u64,
    },

    /// All refresh retries were exhausted.
    #[error("State refresh failed: {message}")]
    StateRefreshFailed {
        /// Description of the final failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a request cancellation error.
    #[inline]
    pub fn request_cancelled(reason: impl Into<String>) -> Self {
        Self::RequestCancelled {
            reason: reason.into(),
        }
    }

    /// Creates a request failure error from a wire error object.
    #[inline]
    pub fn request_failed(error: ErrorObject) -> Self {
        Self::RequestFailed { error }
    }

    /// Creates a too-many-requests error.
    #[inline]
    pub fn too_many_requests(pending: usize, max: usize) -> Self {
        Self::TooManyRequests { pending, max }
    }

    /// Creates an invalid method name error.
    #[inline]
    pub fn invalid_method_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMethodName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a reserved namespace error.
    #[inline]
    pub fn name_reserved(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::NameReserved {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates a duplicate method error.
    #[inline]
    pub fn method_exists(name: impl Into<String>) -> Self {
        Self::MethodExists { name: name.into() }
    }

    /// Creates an invalid topic pattern error.
    #[inline]
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid message error.
    #[inline]
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Creates a minimum-interval error.
    #[inline]
    pub fn min_interval_not_reached(remaining_ms: u64) -> Self {
        Self::MinIntervalNotReached { remaining_ms }
    }

    /// Creates a refresh failure error.
    #[inline]
    pub fn state_refresh_failed(message: impl Into<String>) -> Self {
        Self::StateRefreshFailed {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Codes & Predicates
// ============================================================================

impl Error {
    /// Wire error code for this variant, per PROTOCOL.md Section 5.
    ///
    /// For [`Error::RequestFailed`] this is the code the peer sent.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_LOST",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::RequestCancelled { .. } => "REQUEST_CANCELLED",
            Self::RequestFailed { error } => &error.code,
            Self::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            Self::InvalidMethodName { .. } => "INVALID_METHOD_NAME",
            Self::NameReserved { .. } => "NAME_RESERVED",
            Self::MethodExists { .. } => "METHOD_EXISTS",
            Self::ContextAlreadyFinished => "CONTEXT_ALREADY_FINISHED",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::RefreshInProgress => "REFRESH_IN_PROGRESS",
            Self::MinIntervalNotReached { .. } => "MIN_INTERVAL_NOT_REACHED",
            Self::StateRefreshFailed { .. } => "STATE_REFRESH_FAILED",
            Self::Json(_) => "INVALID_MESSAGE",
            Self::WebSocket(_) => "CONNECTION_FAILED",
            Self::ChannelClosed(_) => "CONNECTION_LOST",
        }
    }

    /// Converts this error into a wire error object.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        if let Self::RequestFailed { error } = self {
            return error.clone();
        }
        ErrorObject::new(self.code(), self.to_string())
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::MinIntervalNotReached { .. }
                | Self::RefreshInProgress
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
