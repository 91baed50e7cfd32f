//! Client session layer for the Spider conversational backend.
//!
//! ARCHITECTURE
//! ============
//! Leaves first:
//!
//! - [`transport`] moves bytes over one full-duplex connection.
//! - [`engine`] turns it into an authenticated, typed message bus with
//!   fixed-delay reconnect.
//! - [`session`] owns the active conversation and runs one turn at a time.
//! - [`store`] is the observable sink the session publishes to.
//!
//! [`wire`] holds the envelope and conversation types shared by all of them;
//! [`history`] and [`auth`] are the external collaborators the session and
//! its callers consume.

pub mod auth;
pub mod config;
pub mod engine;
pub mod history;
pub mod session;
pub mod store;
pub mod transport;
pub mod wire;

pub use auth::{Credential, TokenExchange, TokenPair};
pub use config::{EngineConfig, SessionConfig};
pub use engine::{AuthError, ConnectError, ConnectionState, Engine, SendError};
pub use history::{DirHistory, HistoryError, HistoryFilter, HistorySource, MemoryHistory};
pub use session::{CancelReason, ChatSession, SessionError, TurnOutcome};
pub use store::{AppStore, Snapshot};
pub use transport::{Transport, WsTransport};
pub use wire::{Conversation, Message, Role};

/// Stable, grepable error codes for errors that reach callers.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
