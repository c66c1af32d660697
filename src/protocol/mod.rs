//! Wire protocol types and codec.
//!
//! This module defines the JSON frame format exchanged with a helios
//! server and the pure encode/decode/validate functions over it.
//!
//! See PROTOCOL.md Section 2 for the frame specification.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame envelope and per-type bodies |
//! | `codec` | Encode, decode, and validation |

// ============================================================================
// Submodules
// ============================================================================

/// Frame encoding, decoding, and validation.
pub mod codec;

/// Protocol frame types.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{Decoded, decode, encode, validate};
pub use frame::{
    ErrorBody, Frame, FrameBody, Notification, NotificationBody, PROTOCOL_NAME, PROTOCOL_VERSION,
    RequestBody, ResponseBody, now_ms,
};
