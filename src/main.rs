//! `spider-chat`: interactive terminal client for the Spider backend.
//!
//! Transcript goes to stdout, logs and status lines to stderr. Plain input
//! sends a turn; Ctrl-C during a turn cancels it, at the prompt it quits.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use spider_session::config::ConfigError;
use spider_session::history::{DirHistory, HistoryFilter, HistorySource, MemoryHistory};
use spider_session::{
    AppStore, ChatSession, ConnectionState, Credential, Engine, EngineConfig, ErrorCode, Message, Role,
    SessionConfig, Snapshot, TurnOutcome, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HISTORY_PAGE: usize = 20;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing api key; pass --api-key or set SPIDER_API_KEY")]
    MissingApiKey,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "spider-chat", about = "Interactive client for the Spider chat backend")]
struct Cli {
    #[arg(long, env = "SPIDER_WS_URL", default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    #[arg(long, env = "SPIDER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory of `<id>.json` conversations; completed turns are saved here.
    #[arg(long, env = "SPIDER_HISTORY_DIR")]
    history_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let credential = cli
        .api_key
        .map(Credential::new)
        .filter(|c| !c.is_empty())
        .ok_or(CliError::MissingApiKey)?;
    let session_config = SessionConfig::from_env()?;
    let engine_config = EngineConfig::from_env();

    let saved = cli.history_dir.map(DirHistory::new);
    let history: Arc<dyn HistorySource> = match &saved {
        Some(dir) => Arc::new(dir.clone()),
        None => Arc::new(MemoryHistory::default()),
    };

    let engine = Engine::spawn(Arc::new(WsTransport), engine_config);
    let store = AppStore::new();
    let session = ChatSession::spawn(engine.clone(), history, store.clone(), session_config);

    tokio::spawn(reauthenticate(engine.clone(), credential));
    tokio::spawn(print_updates(store.subscribe()));

    info!(url = %cli.url, "connecting");
    if let Err(e) = engine.connect(&cli.url).await {
        warn!(error = %e, "initial connect failed; retrying in background");
    }

    let result = repl(&session, &store, saved.as_ref()).await;
    engine.disconnect().await;
    result
}

/// Authenticate once each time the engine reaches Open: after the first
/// connect and after every reconnect.
async fn reauthenticate(engine: Engine, credential: Credential) {
    let mut state = engine.watch_state();
    let mut tried = false;
    loop {
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Open if !tried => {
                tried = true;
                match engine.authenticate(&credential).await {
                    Ok(()) => info!("authenticated"),
                    Err(e) => warn!(code = e.error_code(), error = %e, "authentication failed"),
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => tried = false,
            _ => {}
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn repl(session: &ChatSession, store: &AppStore, saved: Option<&DirHistory>) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line.trim();

        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("", _) => {}
            ("/quit", _) => return Ok(()),
            ("/new", _) => {
                if session.new_conversation().await.is_ok() {
                    eprintln!("(new conversation)");
                }
            }
            ("/load", id) if !id.is_empty() => match session.load_conversation(id).await {
                Ok(()) => {
                    if let Some(conversation) = store.snapshot().conversation {
                        conversation.messages.iter().for_each(print_message);
                    }
                }
                Err(e) => eprintln!("error: {}: {e}", e.error_code()),
            },
            ("/history", _) => {
                let filter = HistoryFilter { limit: Some(HISTORY_PAGE), ..HistoryFilter::default() };
                match session.list_history(filter).await {
                    Ok(list) => {
                        for conversation in list {
                            let first = conversation.messages.iter().find(|m| m.role == Role::User);
                            println!(
                                "{}  {}  {}",
                                conversation.id.as_deref().unwrap_or("-"),
                                conversation.metadata.start_time,
                                first.map_or("", |m| preview(&m.content)),
                            );
                        }
                    }
                    Err(e) => eprintln!("error: {}: {e}", e.error_code()),
                }
            }
            (cmd, _) if cmd.starts_with('/') => eprintln!("commands: /new, /load <id>, /history, /quit"),
            _ => run_turn(session, line, saved).await,
        }
    }
}

async fn run_turn(session: &ChatSession, text: &str, saved: Option<&DirHistory>) {
    let cancel = CancellationToken::new();
    let turn = session.send_user_message_with(text, cancel.clone());
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            _ = tokio::signal::ctrl_c() => cancel.cancel(),
        }
    };

    match outcome {
        Ok(TurnOutcome::Completed { conversation_id, .. }) => {
            if let Some(dir) = saved {
                match session.conversation().await {
                    Ok(conversation) => {
                        if let Err(e) = dir.save(&conversation).await {
                            warn!(error = %e, %conversation_id, "history save failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "conversation unavailable"),
                }
            }
        }
        Ok(TurnOutcome::Cancelled(reason)) => eprintln!("(turn cancelled: {reason:?})"),
        Err(e) => eprintln!("error: {}: {e}", e.error_code()),
    }
}

/// Print assistant and tool messages as they are applied to the conversation.
async fn print_updates(mut rx: watch::Receiver<Snapshot>) {
    let mut shown = 0;
    let mut started: Option<String> = None;
    let mut connection = ConnectionState::Disconnected;
    let mut status: Option<String> = None;

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.connection != connection {
            connection = snapshot.connection;
            eprintln!("[{connection:?}]");
        }
        if snapshot.status != status {
            if let Some(line) = &snapshot.status {
                eprintln!("... {line}");
            }
            status = snapshot.status;
        }

        let Some(conversation) = snapshot.conversation else {
            continue;
        };
        // A different conversation was swapped in; its transcript is printed
        // by whoever swapped it.
        if started.as_deref() != Some(conversation.metadata.start_time.as_str()) {
            started = Some(conversation.metadata.start_time.clone());
            shown = conversation.messages.len();
            continue;
        }
        if conversation.messages.len() < shown {
            shown = 0;
        }
        for message in &conversation.messages[shown..] {
            if message.role != Role::User {
                print_message(message);
            }
        }
        shown = conversation.messages.len();
    }
}

fn print_message(message: &Message) {
    match message.role {
        Role::User => println!("> {}", message.content),
        Role::Assistant => {
            if !message.content.is_empty() {
                println!("{}", message.content);
            }
            for call in message.calls() {
                println!("  -> {}({})", call.tool_name, preview(&call.parameters));
            }
        }
        Role::Tool => {
            for result in message.results() {
                println!("  <- {}: {}", result.tool_call_id, preview(&result.result));
            }
        }
    }
}

fn preview(text: &str) -> &str {
    const MAX: usize = 80;
    if text.len() <= MAX {
        return text;
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
