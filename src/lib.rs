//! Client library for the helios-starling WebSocket protocol.
//!
//! A single WebSocket connection carries JSON-framed RPC, pub/sub, and
//! streaming notifications between an application and a helios server. This
//! crate handles the plumbing around it: reconnection with backoff, offline
//! buffering, request correlation and timeouts, progress streams, and
//! session recovery via a server-issued token.
//!
//! # Architecture
//!
//! - [`Starling`] owns the socket and is the single writer to it
//! - The reconnection controller and state manager observe the connection
//!   through an internal event bus; they never hold owning references
//! - Frames built while offline wait in a bounded FIFO buffer and flush in
//!   order on the next open
//!
//! # Quick Start
//!
//! ```no_run
//! use starling_client::{Starling, RequestOptions, MethodOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> starling_client::Result<()> {
//!     let client = Starling::builder("wss://helios.example/ws").build()?;
//!
//!     // Methods the server can call on us.
//!     client.register_method(
//!         "app:echo",
//!         |ctx| async move { ctx.success(ctx.payload().clone()) },
//!         MethodOptions::default(),
//!     )?;
//!
//!     // Server-originated notifications.
//!     let _sub = client.subscribe(
//!         "news.**",
//!         |event| println!("{}: {}", event.topic, event.data),
//!         Default::default(),
//!     )?;
//!
//!     client.connect().await?;
//!
//!     // RPC with a progress stream.
//!     let data = client
//!         .request("files:export", Some(json!({"format": "csv"})), RequestOptions::default())?
//!         .on_progress(|p| println!("progress: {p}"))
//!         .await?;
//!     println!("exported: {data}");
//!
//!     client.disconnect(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`buffer`] | Offline send buffer |
//! | [`client`] | [`Starling`] client core and builder |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Internal event bus and [`BusEvent`] variants |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`methods`] | Inbound method registry and [`RequestContext`] |
//! | [`protocol`] | Wire frames and codec |
//! | [`reconnect`] | Reconnection controller |
//! | [`requests`] | Outbound request registry and [`RequestHandle`] |
//! | [`state`] | Recovery-token state manager |
//! | [`topics`] | Topic subscriptions and pattern dispatch |
//! | [`transport`] | WebSocket transport seam |

// ============================================================================
// Modules
// ============================================================================

/// Offline send buffer.
pub mod buffer;

/// Client core: connection state machine, event loop, public API.
pub mod client;

/// Error types and result aliases.
pub mod error;

/// Internal event bus.
pub mod events;

/// Type-safe identifiers.
pub mod identifiers;

/// Inbound method registry and dispatch.
pub mod methods;

/// Wire protocol types and codec.
pub mod protocol;

/// Reconnection controller.
pub mod reconnect;

/// Outbound request registry.
pub mod requests;

/// Recovery-token state manager.
pub mod state;

/// Topic subscriptions and pattern dispatch.
pub mod topics;

/// WebSocket transport seam.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{ConnectionState, Starling, StarlingBuilder, StarlingOptions};

// Error types
pub use error::{Error, ErrorObject, Result};

// Identifier types
pub use identifiers::{ListenerId, RequestId, SubscriptionId};

// Event types
pub use events::{BusEvent, EventBus, ListenerHandle};

// Protocol types
pub use protocol::{Frame, FrameBody, Notification, PROTOCOL_NAME, PROTOCOL_VERSION};

// Request types
pub use requests::{RequestHandle, RequestOptions, RequestState};

// Method types
pub use methods::{MethodOptions, PROTOCOL_NAMESPACE, RESERVED_NAMESPACES, RequestContext};

// Topic types
pub use topics::{SubscribeOptions, SubscriptionHandle, TopicEvent, TopicPattern};

// Reconnection types
pub use reconnect::{ReconnectOptions, ReconnectionMetrics};

// State types
pub use state::{STATE_REFRESH_METHOD, StateMetrics, StateOptions};

// Transport types
pub use transport::{Transport, TransportStream, TungsteniteTransport};
