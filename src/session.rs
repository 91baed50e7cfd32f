//! Conversation session manager: one active conversation, one turn at a time.
//!
//! DESIGN
//! ======
//! Like the engine, the manager is an actor task behind a cloneable handle.
//! It subscribes to the engine's fan-out and watches its connection state,
//! so inbound envelopes, connectivity changes and caller commands are all
//! applied from one task. The conversation is only ever mutated there.
//!
//! TURN LIFECYCLE
//! ==============
//! `send_user_message` appends the user message optimistically, sends a
//! `chat` envelope with the full history, and parks a single
//! [`PendingRequest`]. While it is parked:
//!
//! - `message` appends (or replaces the streamed-in-progress) message.
//! - `chat_complete` appends what is still missing, assigns the id, resolves.
//! - `error` resolves with a turn failure; applied messages stay.
//! - `status` / `stream` only update the store previews.
//!
//! A turn also ends when its cancellation token fires (local `cancel()`, the
//! caller's token, or the caller dropping the future) and when the engine
//! leaves Ready. A token that is already cancelled ends the turn before
//! anything is appended or sent.
//!
//! The protocol carries no request id. Envelopes arriving with no turn parked
//! are ignored. A `chat_complete` with a full history must carry the parked
//! turn's user message at the index it was sent. After a local cancel the
//! server may still answer the cancelled turn, so until the next turn
//! completes, messages and bare completions no newer than the parked user
//! message are dropped as belonging to the earlier turn.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ErrorCode;
use crate::config::SessionConfig;
use crate::engine::{ConnectionState, Engine, SendError, Subscription};
use crate::history::{HistoryError, HistoryFilter, HistorySource};
use crate::store::{AppStore, Snapshot, StreamPreview};
use crate::wire::{ChatPayload, ChatResponse, ClientEnvelope, Conversation, ConversationMetadata, Message, Role, ServerEnvelope};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()`, the caller's token, or the caller giving up on the turn.
    Local,
    /// The connection dropped before the turn completed.
    ConnectionLost,
}

/// How a turn ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { conversation_id: String, response: Message },
    Cancelled(CancelReason),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection is not authenticated")]
    NotReady,
    #[error("a turn is already in flight")]
    AlreadyPending,
    #[error("conversation `{0}` not found")]
    NotFound(String),
    #[error("turn failed: {0}")]
    TurnFailed(String),
    #[error("send failed: {0}")]
    Send(SendError),
    #[error(transparent)]
    History(HistoryError),
    #[error("session stopped")]
    Stopped,
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotReady => "E_NOT_READY",
            Self::AlreadyPending => "E_ALREADY_PENDING",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::TurnFailed(_) => "E_TURN_FAILED",
            Self::Send(e) => e.error_code(),
            Self::History(_) => "E_HISTORY",
            Self::Stopped => "E_SESSION_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::NotReady | Self::AlreadyPending | Self::TurnFailed(_) => true,
            Self::Send(e) => e.retryable(),
            _ => false,
        }
    }
}

type TurnReply = oneshot::Sender<Result<TurnOutcome, SessionError>>;
type TurnDone = oneshot::Receiver<Result<TurnOutcome, SessionError>>;

/// The single outstanding turn. Nothing of this goes on the wire; replies are
/// matched against the user message that opened the turn.
struct PendingRequest {
    id: Uuid,
    cancel: CancellationToken,
    created_at: Instant,
    /// Position and timestamp of the user message this turn sent.
    user_index: usize,
    user_timestamp: u64,
    reply: TurnReply,
}

enum Command {
    Send {
        text: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<TurnDone, SessionError>>,
    },
    Cancel { reply: oneshot::Sender<bool> },
    NewConversation { reply: oneshot::Sender<()> },
    Load { id: String, reply: oneshot::Sender<Result<(), SessionError>> },
    ListHistory { filter: HistoryFilter, reply: oneshot::Sender<Result<Vec<Conversation>, SessionError>> },
    Current { reply: oneshot::Sender<Conversation> },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to the session task.
#[derive(Clone)]
pub struct ChatSession {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChatSession {
    /// Start the session task, attached to `engine`, publishing to `store`.
    pub fn spawn(engine: Engine, history: Arc<dyn HistorySource>, store: AppStore, config: SessionConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let inbound = engine.add_handler();
        let engine_state = engine.watch_state();
        let conversation = fresh_conversation(&config);

        store.update(|s| {
            s.connection = engine.state();
            s.conversation = Some(conversation.clone());
        });

        let task = SessionTask {
            engine,
            history,
            store,
            config,
            commands: commands_rx,
            inbound,
            engine_state,
            conversation,
            pending: None,
            draining: false,
        };
        tokio::spawn(task.run());

        Self { commands: commands_tx }
    }

    /// Run one turn to its end.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyPending`] while another turn is in flight (no
    /// message is added); [`SessionError::NotReady`] when the engine is not
    /// authenticated (the message stays in the conversation);
    /// [`SessionError::TurnFailed`] when the server reports an error.
    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<TurnOutcome, SessionError> {
        self.send_user_message_with(text, CancellationToken::new()).await
    }

    /// [`send_user_message`](Self::send_user_message) that also ends, as
    /// [`CancelReason::Local`], when `cancel` fires. Dropping the returned
    /// future mid-turn cancels the turn as well.
    ///
    /// # Errors
    ///
    /// As for `send_user_message`.
    pub async fn send_user_message_with(
        &self,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, SessionError> {
        let turn = cancel.child_token();
        // Fires if this future is dropped before the turn resolves.
        let guard = turn.clone().drop_guard();

        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { text: text.into(), cancel: turn.clone(), reply })?;
        let done = rx.await.map_err(|_| SessionError::Stopped)??;

        let outcome = tokio::select! {
            biased;
            result = done => result.unwrap_or(Err(SessionError::Stopped)),
            () = turn.cancelled() => Ok(TurnOutcome::Cancelled(CancelReason::Local)),
        };
        guard.disarm();
        outcome
    }

    /// Cancel the in-flight turn. Returns `false` when there was none.
    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Cancel { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Cancel any in-flight turn and start an empty conversation.
    ///
    /// # Errors
    ///
    /// [`SessionError::Stopped`] if the session task is gone.
    pub async fn new_conversation(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::NewConversation { reply })?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Replace the active conversation with `id` from history.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyPending`] while a turn is in flight,
    /// [`SessionError::NotFound`] when history has no such conversation.
    pub async fn load_conversation(&self, id: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Load { id: id.into(), reply })?;
        rx.await.unwrap_or(Err(SessionError::Stopped))
    }

    /// List history and publish the result to the store.
    ///
    /// # Errors
    ///
    /// [`SessionError::History`] when the source fails.
    pub async fn list_history(&self, filter: HistoryFilter) -> Result<Vec<Conversation>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ListHistory { filter, reply })?;
        rx.await.unwrap_or(Err(SessionError::Stopped))
    }

    /// Copy of the active conversation.
    ///
    /// # Errors
    ///
    /// [`SessionError::Stopped`] if the session task is gone.
    pub async fn conversation(&self) -> Result<Conversation, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Current { reply })?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Stopped)
    }
}

fn fresh_conversation(config: &SessionConfig) -> Conversation {
    Conversation::new(
        ConversationMetadata::starting_now(config.client_tag.clone()),
        config.llm_provider.clone(),
        config.mcp_servers.clone(),
    )
}

// =============================================================================
// TASK
// =============================================================================

struct SessionTask {
    engine: Engine,
    history: Arc<dyn HistorySource>,
    store: AppStore,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: Subscription,
    engine_state: watch::Receiver<ConnectionState>,
    conversation: Conversation,
    pending: Option<PendingRequest>,
    /// A locally cancelled turn may still be answered by the server.
    draining: bool,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                envelope = self.inbound.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.on_envelope(envelope);
                }
                changed = self.engine_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_engine_state();
                }
                () = turn_cancelled(self.pending.as_ref()) => {
                    self.cancel_turn().await;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command).await;
                }
            }
        }
        self.engine.remove_handler(self.inbound.id);
        debug!("session: stopped");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { text, cancel, reply } => {
                let started = self.start_turn(text, cancel).await;
                if let Err(e) = &started {
                    self.record_error(e);
                }
                let _ = reply.send(started);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel_turn().await);
            }
            Command::NewConversation { reply } => {
                self.cancel_turn().await;
                self.conversation = fresh_conversation(&self.config);
                self.publish_conversation();
                info!("session: new conversation");
                let _ = reply.send(());
            }
            Command::Load { id, reply } => {
                let loaded = self.load(id).await;
                if let Err(e) = &loaded {
                    self.record_error(e);
                }
                let _ = reply.send(loaded);
            }
            Command::ListHistory { filter, reply } => {
                let listed = match self.history.list(&filter).await {
                    Ok(list) => {
                        let published = list.clone();
                        self.store.update(|s| s.history = published);
                        Ok(list)
                    }
                    Err(e) => {
                        let e = SessionError::History(e);
                        self.record_error(&e);
                        Err(e)
                    }
                };
                let _ = reply.send(listed);
            }
            Command::Current { reply } => {
                let _ = reply.send(self.conversation.clone());
            }
        }
    }

    async fn start_turn(
        &mut self,
        text: String,
        cancel: CancellationToken,
    ) -> Result<TurnDone, SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::AlreadyPending);
        }
        if cancel.is_cancelled() {
            debug!("session: turn cancelled before dispatch");
            let (reply, done) = oneshot::channel();
            let _ = reply.send(Ok(TurnOutcome::Cancelled(CancelReason::Local)));
            return Ok(done);
        }

        let message = Message::user(text);
        let user_index = self.conversation.messages.len();
        let user_timestamp = message.timestamp;
        self.conversation.messages.push(message);
        self.publish_conversation();

        if !self.engine.is_ready() {
            return Err(SessionError::NotReady);
        }
        let payload = ChatPayload::for_conversation(&self.conversation);
        match self.engine.send(ClientEnvelope::Chat { payload }).await {
            Ok(()) => {}
            Err(SendError::NotReady) => return Err(SessionError::NotReady),
            Err(e) => return Err(SessionError::Send(e)),
        }

        let (reply, done) = oneshot::channel();
        let id = Uuid::new_v4();
        info!(turn = %id, messages = self.conversation.messages.len(), "session: turn started");
        self.pending =
            Some(PendingRequest { id, cancel, created_at: Instant::now(), user_index, user_timestamp, reply });
        self.store.update(|s| {
            s.turn_in_flight = true;
            s.status = None;
            s.stream = None;
        });
        Ok(done)
    }

    /// Local cancellation of the parked turn. Resolves the caller first, then
    /// tells the server best-effort.
    async fn cancel_turn(&mut self) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        pending.cancel.cancel();
        self.finish_turn(Ok(TurnOutcome::Cancelled(CancelReason::Local)));
        self.draining = true;

        if let Err(e) = self.engine.send(ClientEnvelope::Cancel).await {
            debug!(error = %e, "session: cancel not delivered");
        }
        true
    }

    async fn load(&mut self, id: String) -> Result<(), SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::AlreadyPending);
        }
        let mut conversation = self.history.get(&id).await.map_err(|e| match e {
            HistoryError::NotFound(_) => SessionError::NotFound(id.clone()),
            other => SessionError::History(other),
        })?;
        if conversation.id.is_none() {
            conversation.id = Some(id);
        }
        info!(id = ?conversation.id, messages = conversation.messages.len(), "session: conversation loaded");
        self.conversation = conversation;
        self.publish_conversation();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Engine events
    // -------------------------------------------------------------------------

    fn on_engine_state(&mut self) {
        let state = *self.engine_state.borrow_and_update();
        self.store.update(|s| s.connection = state);
        if state != ConnectionState::Ready {
            // Nothing from a closed connection can arrive any more.
            self.draining = false;
        }
        if state != ConnectionState::Ready && self.pending.is_some() {
            warn!(?state, "session: connection lost mid-turn");
            self.finish_turn(Ok(TurnOutcome::Cancelled(CancelReason::ConnectionLost)));
        }
    }

    fn on_envelope(&mut self, envelope: ServerEnvelope) {
        if self.pending.is_none() {
            trace!(kind = envelope.kind(), "session: no turn in flight, ignoring");
            return;
        }
        match envelope {
            ServerEnvelope::Message { message } => self.apply_message(message),
            ServerEnvelope::ChatComplete { payload } => self.complete_turn(payload),
            ServerEnvelope::Error { error } => {
                warn!(%error, "session: turn failed");
                self.finish_turn(Err(SessionError::TurnFailed(error)));
            }
            ServerEnvelope::Status { status, message } => {
                let line = match message {
                    Some(detail) => format!("{status}: {detail}"),
                    None => status,
                };
                self.store.update(|s| s.status = Some(line));
            }
            ServerEnvelope::Stream { iteration, message, tool_calls } => {
                let preview = StreamPreview { iteration, text: message, tool_calls };
                self.store.update(|s| s.stream = Some(preview));
            }
            ServerEnvelope::AuthSuccess { .. } | ServerEnvelope::AuthError { .. } | ServerEnvelope::Pong => {}
        }
    }

    /// Apply a streamed message. A non-user message with the same role and
    /// timestamp as the last one is an update of it and replaces it.
    fn apply_message(&mut self, message: Message) {
        if message.role != Role::User && self.is_stale(message.timestamp) {
            debug!(role = ?message.role, timestamp = message.timestamp, "session: dropping message from cancelled turn");
            return;
        }
        let replacing = message.role != Role::User
            && self
                .conversation
                .messages
                .last()
                .is_some_and(|last| last.role == message.role && last.timestamp == message.timestamp);

        if let Err(e) = self.conversation.check_message(&message, replacing) {
            warn!(error = %e, role = ?message.role, "session: dropping message");
            return;
        }
        if replacing {
            self.conversation.messages.pop();
        }
        self.conversation.messages.push(message);
        self.publish_conversation();
    }

    fn append_checked(&mut self, message: Message) {
        match self.conversation.check_message(&message, false) {
            Ok(()) => self.conversation.messages.push(message),
            Err(e) => warn!(error = %e, role = ?message.role, "session: dropping message"),
        }
    }

    fn complete_turn(&mut self, payload: ChatResponse) {
        let ChatResponse { conversation_id, response, all_messages } = payload;

        let stale = if all_messages.is_empty() {
            self.is_stale(response.timestamp)
        } else {
            !self.answers_pending(&all_messages)
        };
        if stale {
            warn!(%conversation_id, "session: dropping completion of an earlier turn");
            self.draining = false;
            return;
        }

        if all_messages.is_empty() {
            if self.conversation.messages.last() != Some(&response) {
                self.append_checked(response.clone());
            }
        } else {
            let known = self.conversation.messages.len();
            for message in all_messages.into_iter().skip(known) {
                self.append_checked(message);
            }
        }

        if let Some(existing) = &self.conversation.id {
            if *existing != conversation_id {
                debug!(%existing, received = %conversation_id, "session: keeping existing conversation id");
            }
        } else {
            self.conversation.id = Some(conversation_id.clone());
        }
        self.publish_conversation();
        self.finish_turn(Ok(TurnOutcome::Completed { conversation_id, response }));
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// After a local cancel, anything no newer than the current turn's user
    /// message belongs to the cancelled turn.
    fn is_stale(&self, timestamp: u64) -> bool {
        self.draining && self.pending.as_ref().is_some_and(|p| timestamp <= p.user_timestamp)
    }

    /// A full history answers the pending turn only if it carries that turn's
    /// user message at the position it was sent.
    fn answers_pending(&self, all_messages: &[Message]) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        let sent = self.conversation.messages.get(pending.user_index);
        match (sent, all_messages.get(pending.user_index)) {
            (Some(sent), Some(echoed)) => echoed.role == Role::User && echoed.content == sent.content,
            _ => false,
        }
    }

    fn finish_turn(&mut self, outcome: Result<TurnOutcome, SessionError>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if matches!(outcome, Ok(TurnOutcome::Completed { .. })) {
            self.draining = false;
        }
        let elapsed_ms = u64::try_from(pending.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(TurnOutcome::Completed { conversation_id, .. }) => {
                info!(turn = %pending.id, %conversation_id, elapsed_ms, "session: turn complete");
            }
            Ok(TurnOutcome::Cancelled(reason)) => {
                info!(turn = %pending.id, ?reason, elapsed_ms, "session: turn cancelled");
            }
            Err(e) => {
                warn!(turn = %pending.id, error = %e, elapsed_ms, "session: turn ended with error");
                self.record_error(e);
            }
        }
        self.store.update(Snapshot::clear_turn);
        let _ = pending.reply.send(outcome);
    }

    fn publish_conversation(&self) {
        let conversation = self.conversation.clone();
        self.store.update(|s| s.conversation = Some(conversation));
    }

    fn record_error(&self, err: &SessionError) {
        let line = format!("{}: {err}", err.error_code());
        self.store.update(|s| s.last_error = Some(line));
    }
}

async fn turn_cancelled(pending: Option<&PendingRequest>) {
    match pending {
        Some(pending) => pending.cancel.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
