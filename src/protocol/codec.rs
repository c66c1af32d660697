//! Frame encoding, decoding, and validation.
//!
//! Pure functions: no I/O, no shared state. The connection event loop feeds
//! every inbound WebSocket message through [`decode`] and routes on the
//! returned [`Decoded`] variant; outbound frames go through [`encode`].
//!
//! Validation enforces the field rules of PROTOCOL.md Section 2. A missing
//! `protocol` field is tolerated for backward compatibility; an unknown
//! `type` value fails validation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::protocol::frame::{Frame, FrameBody, PROTOCOL_NAME};

// ============================================================================
// Method Grammar
// ============================================================================

/// Wire grammar for method names: letter first, then word chars, dots, colons.
static WIRE_METHOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][\w.:]*$").expect("wire method pattern compiles"));

/// Minimum method name length.
pub(crate) const MIN_METHOD_LEN: usize = 3;

// ============================================================================
// Decoded
// ============================================================================

/// Classification of an inbound WebSocket message.
#[derive(Debug)]
pub enum Decoded {
    /// A frame that passed schema validation.
    Valid(Box<Frame>),

    /// Text that parsed as JSON but failed schema validation.
    InvalidJson {
        /// The parsed JSON value, for the raw-frame hook.
        value: Value,
        /// Why validation failed.
        reason: String,
    },

    /// Text that is not JSON at all.
    Text(String),

    /// A binary message.
    Binary(Vec<u8>),
}

// ============================================================================
// Encode
// ============================================================================

/// Serializes a frame to its wire representation.
///
/// Envelope fields (`protocol`, `version`, `timestamp`) are stamped by the
/// [`Frame`] constructors, so every frame built by this crate serializes
/// complete.
///
/// # Errors
///
/// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
pub fn encode(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

// ============================================================================
// Decode
// ============================================================================

/// Classifies an inbound WebSocket message.
///
/// Returns `None` for control messages (ping, pong, close) which are handled
/// by the event loop directly.
#[must_use]
pub fn decode(message: &Message) -> Option<Decoded> {
    match message {
        Message::Text(text) => Some(decode_text(text.as_str())),
        Message::Binary(bytes) => Some(Decoded::Binary(bytes.to_vec())),
        _ => None,
    }
}

fn decode_text(text: &str) -> Decoded {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Decoded::Text(text.to_string()),
    };

    match serde_json::from_value::<Frame>(value.clone()) {
        Ok(frame) => match validate(&frame) {
            Ok(()) => Decoded::Valid(Box::new(frame)),
            Err(reason) => Decoded::InvalidJson { value, reason },
        },
        Err(err) => Decoded::InvalidJson {
            value,
            reason: err.to_string(),
        },
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Checks a parsed frame against the protocol field rules.
///
/// # Errors
///
/// Returns a human-readable reason on the first violated rule.
pub fn validate(frame: &Frame) -> std::result::Result<(), String> {
    if let Some(protocol) = &frame.protocol
        && protocol != PROTOCOL_NAME
    {
        return Err(format!("unknown protocol '{protocol}'"));
    }

    if !is_semver(&frame.version) {
        return Err(format!("version '{}' is not MAJOR.MINOR.PATCH", frame.version));
    }

    if frame.timestamp == 0 {
        return Err("timestamp must be a positive integer".to_string());
    }

    match &frame.body {
        FrameBody::Request(body) => {
            if body.method.len() < MIN_METHOD_LEN {
                return Err(format!(
                    "method '{}' shorter than {MIN_METHOD_LEN} characters",
                    body.method
                ));
            }
            if !WIRE_METHOD_RE.is_match(&body.method) {
                return Err(format!("method '{}' fails the name grammar", body.method));
            }
            if !body.request_id.is_v4() {
                return Err("requestId is not a UUID v4".to_string());
            }
        }

        FrameBody::Response(body) => {
            if !body.request_id.is_v4() {
                return Err("requestId is not a UUID v4".to_string());
            }
            if body.success && body.error.is_some() {
                return Err("success response carries an error".to_string());
            }
            if !body.success {
                let Some(error) = &body.error else {
                    return Err("failure response missing error".to_string());
                };
                if error.code.is_empty() {
                    return Err("error code is empty".to_string());
                }
                if body.data.is_some() {
                    return Err("failure response carries data".to_string());
                }
            }
        }

        FrameBody::Notification(body) => {
            if let Some(request_id) = body.notification.request_id
                && !request_id.is_v4()
            {
                return Err("notification requestId is not a UUID v4".to_string());
            }
            if let Some(topic) = &body.notification.topic
                && topic.is_empty()
            {
                return Err("notification topic is empty".to_string());
            }
        }

        FrameBody::Error(body) => {
            if body.error.code.is_empty() {
                return Err("error code is empty".to_string());
            }
            if let Some(request_id) = body.request_id
                && !request_id.is_v4()
            {
                return Err("error requestId is not a UUID v4".to_string());
            }
        }
    }

    Ok(())
}

fn is_semver(version: &str) -> bool {
    let mut parts = 0;
    for part in version.split('.') {
        parts += 1;
        if parts > 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    parts == 3
}

// ============================================================================
// Tests
// ============================================================================
