//! WebSocket transport seam.
//!
//! The client drives any [`Transport`] implementation; production code uses
//! [`TungsteniteTransport`], tests inject an in-memory pair. A transport
//! hands back the split sink/stream halves of an established socket.

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;

// ============================================================================
// Types
// ============================================================================

/// Boxed write half of a socket.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Boxed read half of a socket.
pub type WsStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

// ============================================================================
// TransportStream
// ============================================================================

/// An established bidirectional socket, split.
pub struct TransportStream {
    /// Write half.
    pub sink: WsSink,
    /// Read half.
    pub stream: WsStream,
}

// ============================================================================
// Transport
// ============================================================================

/// Opens WebSocket connections for the client.
pub trait Transport: Send + Sync + 'static {
    /// Connects to `url` and returns the split socket.
    ///
    /// The future resolves once the WebSocket handshake completes; the
    /// client applies its own connect timeout around this call.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportStream>>;
}

// ============================================================================
// TungsteniteTransport
// ============================================================================

/// Production transport over `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportStream>> {
        let url = url.to_string();
        Box::pin(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(&url).await?;
            let (sink, stream) = socket.split();
            Ok(TransportStream {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
