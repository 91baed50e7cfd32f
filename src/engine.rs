//! Session protocol engine: an authenticated, typed message bus over a transport.
//!
//! DESIGN
//! ======
//! One actor task owns the connection state machine. The cloneable
//! [`Engine`] handle turns every public operation into a command on an
//! unbounded channel; transport events, open results, and the reconnect and
//! keepalive deadlines all land in the same `select!` loop, so connection
//! state is never mutated from two places at once. Commands are polled
//! first: a handler registered before a frame arrives sees that frame.
//!
//! ```text
//! Disconnected --connect--> Connecting --opened--> Open --authenticate--> Authenticating
//!      ^                        |                   ^                        |      |
//!      |                   open failed              +------- auth_error -----+      |
//!      |                        v                                           auth_success
//!      +---- 3s timer ---- Disconnected <--- closed / error ----- Ready <-----------+
//! ```
//!
//! Connection state is published on a `watch` channel. Every state change is
//! visible there before any waiter or handler observes the envelope that
//! caused it.
//!
//! RECONNECT
//! =========
//! The auth wait is bounded by a deadline owned by the task, next to the
//! reconnect and keepalive deadlines. A caller that stops waiting cannot
//! leave the engine stuck in Authenticating.
//!
//! An unplanned close schedules one reconnect after a fixed delay. The
//! deadline is a single `Option<Instant>`, so scheduling while one is pending
//! is a no-op and at most one timer exists. `disconnect()` clears the
//! deadline and disables auto-reconnect until the next `connect()`.
//! Authentication never survives a transport cycle.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures and malformed frames stay inside the engine: the former
//! trigger reconnect scheduling, the latter are logged and dropped. Only
//! `ConnectError`, `AuthError` and `SendError` reach callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ErrorCode;
use crate::auth::Credential;
use crate::config::EngineConfig;
use crate::transport::{Link, Transport, TransportError, TransportEvent};
use crate::wire::{self, ClientEnvelope, ProtocolError, ServerEnvelope};

// =============================================================================
// TYPES
// =============================================================================

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Authenticating,
    Ready,
    Closing,
}

impl ConnectionState {
    /// Whether a transport connection is currently established.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Open | Self::Authenticating | Self::Ready)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("{0}")]
    Transport(TransportError),
    #[error("connect aborted by disconnect")]
    Aborted,
    #[error("engine stopped")]
    EngineStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("not connected")]
    NotConnected,
    #[error("authentication already in progress")]
    InProgress,
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("connection lost during authentication")]
    ConnectionLost,
    #[error("timed out waiting for authentication reply")]
    Timeout,
    #[error("engine stopped")]
    EngineStopped,
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::InProgress => "E_AUTH_IN_PROGRESS",
            Self::Rejected(_) => "E_AUTH_REJECTED",
            Self::ConnectionLost => "E_CONNECTION_LOST",
            Self::Timeout => "E_AUTH_TIMEOUT",
            Self::EngineStopped => "E_ENGINE_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost | Self::Timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is not authenticated")]
    NotReady,
    #[error("{0}")]
    Transport(TransportError),
    #[error("{0}")]
    Encode(#[from] ProtocolError),
    #[error("engine stopped")]
    EngineStopped,
}

impl ErrorCode for SendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotReady => "E_NOT_READY",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Encode(_) => "E_ENCODE",
            Self::EngineStopped => "E_ENGINE_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotReady | Self::Transport(_))
    }
}

/// Identifies a registered handler for `remove_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A registered handler: every dispatched envelope arrives on `rx`, in the
/// order the transport delivered it.
#[derive(Debug)]
pub struct Subscription {
    pub id: HandlerId,
    pub rx: mpsc::UnboundedReceiver<ServerEnvelope>,
}

type Matcher = Box<dyn Fn(&ServerEnvelope) -> bool + Send>;

struct Waiter {
    matches: Matcher,
    reply: oneshot::Sender<ServerEnvelope>,
}

enum Command {
    Connect { endpoint: String, reply: oneshot::Sender<Result<(), ConnectError>> },
    BeginAuth { credential: Credential, reply: oneshot::Sender<Result<(), AuthError>> },
    Send { envelope: ClientEnvelope, reply: oneshot::Sender<Result<(), SendError>> },
    AddHandler { id: HandlerId, tx: mpsc::UnboundedSender<ServerEnvelope> },
    RemoveHandler { id: HandlerId },
    AwaitNext(Waiter),
    Disconnect { reply: oneshot::Sender<()> },
    ReconnectDeadline { reply: oneshot::Sender<Option<Instant>> },
}

/// The auth envelope is on the wire; resolved by the reply, the deadline, or
/// teardown, whichever comes first.
struct PendingAuth {
    deadline: Instant,
    reply: oneshot::Sender<Result<(), AuthError>>,
}

/// Result of a `Transport::open` call, tagged with the attempt that made it.
struct OpenResult {
    attempt: u64,
    result: Result<Box<dyn Link>, TransportError>,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to the engine task. The task stops once every handle is
/// dropped.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_handler: Arc<AtomicU64>,
}

impl Engine {
    /// Start the engine task on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (open_tx, open_rx) = mpsc::unbounded_channel();

        let task = EngineTask {
            transport,
            config,
            state: state_tx,
            commands: commands_rx,
            open_tx,
            open_rx,
            endpoint: None,
            auto_reconnect: false,
            attempt: 0,
            link: None,
            opened: false,
            events: None,
            reconnect_at: None,
            next_ping: None,
            auth: None,
            connect_waiters: Vec::new(),
            handlers: Vec::new(),
            waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        Self { commands: commands_tx, state: state_rx, next_handler: Arc::new(AtomicU64::new(1)) }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the connection is open and authenticated.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Open the connection and enable auto-reconnect.
    ///
    /// Resolves once the transport reports the connection open. Returns
    /// immediately when already connected; joins the in-flight attempt when
    /// one is running.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Transport`] when this attempt fails (a reconnect is
    /// still scheduled), [`ConnectError::Aborted`] when `disconnect()` runs
    /// first.
    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { endpoint: endpoint.to_owned(), reply })
            .map_err(|()| ConnectError::EngineStopped)?;
        rx.await.unwrap_or(Err(ConnectError::EngineStopped))
    }

    /// Authenticate the open connection with `credential`.
    ///
    /// Sends one `auth` envelope and waits for the next `auth_success` or
    /// `auth_error`. On success the engine is Ready before this returns; on
    /// rejection or timeout it is back to Open and the caller may retry.
    /// Dropping the returned future does not cancel the wait inside the
    /// engine: the deadline still returns it to Open.
    ///
    /// # Errors
    ///
    /// See [`AuthError`].
    pub async fn authenticate(&self, credential: &Credential) -> Result<(), AuthError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::BeginAuth { credential: credential.clone(), reply })
            .map_err(|()| AuthError::EngineStopped)?;
        rx.await.unwrap_or(Err(AuthError::EngineStopped))
    }

    /// Send one envelope on the authenticated connection.
    ///
    /// # Errors
    ///
    /// [`SendError::NotReady`] unless the engine is Ready.
    pub async fn send(&self, envelope: ClientEnvelope) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { envelope, reply }).map_err(|()| SendError::EngineStopped)?;
        rx.await.unwrap_or(Err(SendError::EngineStopped))
    }

    /// Register a handler. Dropping the subscription also unregisters it.
    #[must_use]
    pub fn add_handler(&self) -> Subscription {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.command(Command::AddHandler { id, tx });
        Subscription { id, rx }
    }

    pub fn remove_handler(&self, id: HandlerId) {
        let _ = self.command(Command::RemoveHandler { id });
    }

    /// Resolve with the next inbound envelope matching `matches`, then
    /// unregister. The receiver errors if the connection drops first.
    pub fn next_matching<F>(&self, matches: F) -> oneshot::Receiver<ServerEnvelope>
    where
        F: Fn(&ServerEnvelope) -> bool + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let _ = self.command(Command::AwaitNext(Waiter { matches: Box::new(matches), reply }));
        rx
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub async fn reconnect_deadline(&self) -> Option<Instant> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ReconnectDeadline { reply }).ok()?;
        rx.await.ok().flatten()
    }

    fn command(&self, command: Command) -> Result<(), ()> {
        self.commands.send(command).map_err(|_| ())
    }
}

// =============================================================================
// TASK
// =============================================================================

struct EngineTask {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    open_tx: mpsc::UnboundedSender<OpenResult>,
    open_rx: mpsc::UnboundedReceiver<OpenResult>,

    endpoint: Option<String>,
    auto_reconnect: bool,
    /// Bumped on every connect attempt and every teardown; open results and
    /// events from older attempts are ignored.
    attempt: u64,
    link: Option<Box<dyn Link>>,
    /// The transport has reported `Opened` for the current attempt.
    opened: bool,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    reconnect_at: Option<Instant>,
    next_ping: Option<Instant>,
    auth: Option<PendingAuth>,

    connect_waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    handlers: Vec<(HandlerId, mpsc::UnboundedSender<ServerEnvelope>)>,
    waiters: Vec<Waiter>,
}

impl EngineTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command);
                }
                event = recv_event(&mut self.events) => match event {
                    Some(event) => self.on_transport_event(event),
                    None => self.on_events_dropped(),
                },
                Some(open) = self.open_rx.recv() => self.on_open_result(open),
                () = sleep_until_opt(self.reconnect_at) => self.on_reconnect_due(),
                () = sleep_until_opt(self.next_ping) => self.on_ping_due(),
                () = sleep_until_opt(self.auth.as_ref().map(|a| a.deadline)) => self.on_auth_timeout(),
            }
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        debug!("engine: stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let prev = self.current();
        if prev == next {
            return;
        }
        debug!(?prev, ?next, "engine: state");
        self.state.send_replace(next);
        self.next_ping = match (next, self.config.ping_interval) {
            (ConnectionState::Ready, Some(every)) => Some(Instant::now() + every),
            _ => None,
        };
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => self.on_connect(endpoint, reply),
            Command::BeginAuth { credential, reply } => self.on_begin_auth(&credential, reply),
            Command::Send { envelope, reply } => {
                let _ = reply.send(self.send_now(&envelope));
            }
            Command::AddHandler { id, tx } => self.handlers.push((id, tx)),
            Command::RemoveHandler { id } => self.handlers.retain(|(h, _)| *h != id),
            Command::AwaitNext(waiter) => self.waiters.push(waiter),
            Command::Disconnect { reply } => {
                self.on_disconnect();
                let _ = reply.send(());
            }
            Command::ReconnectDeadline { reply } => {
                let _ = reply.send(self.reconnect_at);
            }
        }
    }

    fn on_connect(&mut self, endpoint: String, reply: oneshot::Sender<Result<(), ConnectError>>) {
        self.auto_reconnect = true;
        match self.current() {
            state if state.is_connected() => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(reply),
            _ => {
                self.endpoint = Some(endpoint);
                self.connect_waiters.push(reply);
                self.start_connect();
            }
        }
    }

    fn on_begin_auth(&mut self, credential: &Credential, reply: oneshot::Sender<Result<(), AuthError>>) {
        let outcome = match self.current() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Authenticating => Err(AuthError::InProgress),
            ConnectionState::Open => {
                self.set_state(ConnectionState::Authenticating);
                let envelope = ClientEnvelope::Auth { api_key: credential.expose().to_owned() };
                match self.write(&envelope) {
                    Ok(()) => {
                        info!("engine: authenticating");
                        let deadline = Instant::now() + self.config.auth_timeout;
                        self.auth = Some(PendingAuth { deadline, reply });
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "engine: auth envelope not sent");
                        self.set_state(ConnectionState::Open);
                        Err(AuthError::ConnectionLost)
                    }
                }
            }
            _ => Err(AuthError::NotConnected),
        };
        let _ = reply.send(outcome);
    }

    fn on_auth_timeout(&mut self) {
        if self.current() == ConnectionState::Authenticating {
            warn!("engine: authentication timed out");
            self.set_state(ConnectionState::Open);
        }
        self.finish_auth(Err(AuthError::Timeout));
    }

    /// Resolve the pending `authenticate` call, if its caller is still waiting.
    fn finish_auth(&mut self, outcome: Result<(), AuthError>) {
        if let Some(auth) = self.auth.take() {
            let _ = auth.reply.send(outcome);
        }
    }

    fn on_disconnect(&mut self) {
        info!("engine: disconnect requested");
        self.set_state(ConnectionState::Closing);
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.teardown();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Aborted));
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    fn start_connect(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        self.attempt += 1;
        self.opened = false;
        self.link = None;
        self.set_state(ConnectionState::Connecting);
        info!(%endpoint, attempt = self.attempt, "engine: connecting");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events = Some(events_rx);

        let transport = self.transport.clone();
        let open_tx = self.open_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = transport.open(&endpoint, events_tx).await;
            let _ = open_tx.send(OpenResult { attempt, result });
        });
    }

    fn on_open_result(&mut self, open: OpenResult) {
        if open.attempt != self.attempt || self.current() != ConnectionState::Connecting {
            if let Ok(link) = open.result {
                link.close();
            }
            return;
        }
        match open.result {
            Ok(link) => {
                self.link = Some(link);
                self.maybe_opened();
            }
            Err(e) => {
                warn!(error = %e, "engine: connect failed");
                self.events = None;
                self.set_state(ConnectionState::Disconnected);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(ConnectError::Transport(e.clone())));
                }
                self.schedule_reconnect();
            }
        }
    }

    /// Connecting → Open once the transport has both reported `Opened` and
    /// handed back its link.
    fn maybe_opened(&mut self) {
        if self.current() != ConnectionState::Connecting || !self.opened || self.link.is_none() {
            return;
        }
        self.reconnect_at = None;
        self.set_state(ConnectionState::Open);
        info!("engine: connection open");
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.opened = true;
                self.maybe_opened();
            }
            TransportEvent::Frame(bytes) => match wire::decode_server(&bytes) {
                Ok(envelope) => self.on_envelope(envelope),
                Err(e) => warn!(error = %e, len = bytes.len(), "engine: dropping malformed envelope"),
            },
            TransportEvent::Closed(reason) | TransportEvent::Error(reason) => self.on_connection_lost(&reason),
        }
    }

    /// The transport released its event sender without reporting a close.
    /// While connecting the open result still decides the outcome.
    fn on_events_dropped(&mut self) {
        self.events = None;
        if self.current() != ConnectionState::Connecting {
            self.on_connection_lost("event channel dropped");
        }
    }

    fn on_connection_lost(&mut self, reason: &str) {
        warn!(reason, state = ?self.current(), "engine: connection lost");
        self.set_state(ConnectionState::Disconnected);
        self.teardown();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Transport(TransportError::Connect(reason.to_owned()))));
        }
        self.schedule_reconnect();
    }

    /// Drop everything tied to the current connection.
    fn teardown(&mut self) {
        self.attempt += 1;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.events = None;
        self.opened = false;
        self.finish_auth(Err(AuthError::ConnectionLost));
        // Pending one-shot waits observe a closed channel.
        self.waiters.clear();
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect {
            return;
        }
        if self.reconnect_at.is_some() {
            debug!("engine: reconnect already scheduled");
            return;
        }
        let delay = self.config.reconnect_delay;
        self.reconnect_at = Some(Instant::now() + delay);
        info!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "engine: reconnect scheduled");
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.auto_reconnect && self.current() == ConnectionState::Disconnected {
            self.start_connect();
        }
    }

    fn on_ping_due(&mut self) {
        self.next_ping = None;
        if self.current() != ConnectionState::Ready {
            return;
        }
        if let Err(e) = self.write(&ClientEnvelope::Ping) {
            debug!(error = %e, "engine: ping failed");
        }
        self.next_ping = self.config.ping_interval.map(|every| Instant::now() + every);
    }

    // -------------------------------------------------------------------------
    // Envelopes
    // -------------------------------------------------------------------------

    fn send_now(&mut self, envelope: &ClientEnvelope) -> Result<(), SendError> {
        if self.current() != ConnectionState::Ready {
            return Err(SendError::NotReady);
        }
        self.write(envelope)
    }

    fn write(&self, envelope: &ClientEnvelope) -> Result<(), SendError> {
        let bytes = wire::encode_client(envelope)?;
        let link = self.link.as_ref().ok_or(SendError::Transport(TransportError::Closed))?;
        link.send(bytes).map_err(SendError::Transport)
    }

    fn on_envelope(&mut self, envelope: ServerEnvelope) {
        trace!(kind = envelope.kind(), "engine: envelope");
        match &envelope {
            ServerEnvelope::AuthSuccess { .. } if self.current() == ConnectionState::Authenticating => {
                info!("engine: authenticated");
                self.set_state(ConnectionState::Ready);
                self.finish_auth(Ok(()));
            }
            ServerEnvelope::AuthError { error } if self.current() == ConnectionState::Authenticating => {
                warn!(%error, "engine: authentication rejected");
                self.set_state(ConnectionState::Open);
                self.finish_auth(Err(AuthError::Rejected(error.clone())));
            }
            ServerEnvelope::Pong => return,
            _ => {}
        }

        let (fire, keep): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .filter(|w| !w.reply.is_closed())
            .partition(|w| (w.matches)(&envelope));
        self.waiters = keep;
        for waiter in fire {
            let _ = waiter.reply.send(envelope.clone());
        }

        self.handlers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
