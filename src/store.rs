//! Application state store: observable snapshot of session state.
//!
//! DESIGN
//! ======
//! The session manager is the only writer. Readers either take a
//! [`Snapshot`] clone or subscribe to a `watch` receiver and react to
//! changes; intermediate states may be coalesced, the latest is never lost.

use std::sync::Arc;

use tokio::sync::watch;

use crate::engine::ConnectionState;
use crate::wire::Conversation;

/// Latest `stream` envelope of the running turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPreview {
    pub iteration: u32,
    pub text: String,
    /// Raw tool-call text as the server sent it.
    pub tool_calls: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub connection: ConnectionState,
    /// The active conversation, including optimistic local messages.
    pub conversation: Option<Conversation>,
    pub turn_in_flight: bool,
    /// Latest `status` line of the running turn.
    pub status: Option<String>,
    pub stream: Option<StreamPreview>,
    /// Result of the most recent history listing.
    pub history: Vec<Conversation>,
    /// `code: message` of the most recent failure.
    pub last_error: Option<String>,
}

impl Snapshot {
    /// Messages of the active conversation, empty when none.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.conversation.as_ref().map_or(0, |c| c.messages.len())
    }

    /// Forget the per-turn previews.
    pub fn clear_turn(&mut self) {
        self.turn_in_flight = false;
        self.status = None;
        self.stream = None;
    }
}

/// Cloneable handle to the shared snapshot.
#[derive(Debug, Clone)]
pub struct AppStore {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for AppStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStore {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Snapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Mutate the snapshot in place; subscribers are notified only when the
    /// result differs.
    pub fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            f(snapshot);
            *snapshot != before
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
