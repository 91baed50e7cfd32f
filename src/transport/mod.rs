//! Transport: one physical full-duplex connection, no protocol knowledge.
//!
//! DESIGN
//! ======
//! `Transport::open` establishes a connection and hands back a [`Link`] for
//! outbound bytes. Inbound traffic and lifecycle changes arrive as
//! [`TransportEvent`]s on the channel supplied to `open`; each connection
//! gets its own channel so events from a replaced connection can never leak
//! into the next one. Retry policy lives in the engine, not here.

pub mod ws;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use ws::WsTransport;

/// Connection-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// A frame could not be written.
    #[error("send failed: {0}")]
    Send(String),
    /// The connection is no longer open.
    #[error("connection closed")]
    Closed,
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer accepted the connection; frames may now flow.
    Opened,
    /// One inbound frame.
    Frame(Vec<u8>),
    /// The connection ended normally or was closed by the peer.
    Closed(String),
    /// The connection failed.
    Error(String),
}

/// Sending half of an open connection.
pub trait Link: Send + Sync {
    /// Queue one outbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the connection is gone.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Begin closing the connection. Idempotent.
    fn close(&self);
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `endpoint`, delivering its events to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the connection cannot be made.
    async fn open(
        &self,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Link>, TransportError>;
}
