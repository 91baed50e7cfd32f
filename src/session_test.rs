use super::*;
use crate::auth::Credential;
use crate::config::EngineConfig;
use crate::history::MemoryHistory;
use crate::transport::mock::{MockPeer, MockTransport};
use serde_json::json;
use std::time::Duration;

struct Harness {
    engine: Engine,
    peer: MockPeer,
    session: ChatSession,
    store: AppStore,
}

fn engine_config() -> EngineConfig {
    EngineConfig { reconnect_delay: Duration::from_secs(3), auth_timeout: Duration::from_secs(10), ping_interval: None }
}

fn session_config() -> SessionConfig {
    SessionConfig { llm_provider: "anthropic".to_owned(), mcp_servers: vec!["fs".to_owned()], client_tag: "test".to_owned() }
}

async fn connected(history: Vec<Conversation>) -> (Engine, MockPeer, ChatSession, AppStore) {
    let mock = MockTransport::new();
    let engine = Engine::spawn(mock.clone(), engine_config());
    let store = AppStore::new();
    let session = ChatSession::spawn(engine.clone(), Arc::new(MemoryHistory::new(history)), store.clone(), session_config());
    engine.connect("ws://spider.test/ws").await.expect("connect");
    let peer = mock.next_peer().await;
    (engine, peer, session, store)
}

async fn ready_with(history: Vec<Conversation>) -> Harness {
    let (engine, mut peer, session, store) = connected(history).await;
    let auth = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.authenticate(&Credential::new("k1")).await })
    };
    assert_eq!(peer.recv().await["type"], "auth");
    peer.push(json!({"type": "auth_success", "message": "ok"}));
    auth.await.unwrap().expect("auth");
    Harness { engine, peer, session, store }
}

async fn ready() -> Harness {
    ready_with(Vec::new()).await
}

fn spawn_send(session: &ChatSession, text: &str) -> tokio::task::JoinHandle<Result<TurnOutcome, SessionError>> {
    let session = session.clone();
    let text = text.to_owned();
    tokio::spawn(async move { session.send_user_message(text).await })
}

async fn wait_snapshot(store: &AppStore, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
    let mut rx = store.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
        .await
        .expect("snapshot condition not reached")
        .expect("store closed");
    snapshot.clone()
}

async fn outcome(handle: tokio::task::JoinHandle<Result<TurnOutcome, SessionError>>) -> Result<TurnOutcome, SessionError> {
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("turn did not resolve").expect("task")
}

/// Start a turn and wait until the session has parked it.
async fn start_turn(h: &mut Harness, text: &str) -> tokio::task::JoinHandle<Result<TurnOutcome, SessionError>> {
    let turn = spawn_send(&h.session, text);
    let chat = h.peer.recv().await;
    assert_eq!(chat["type"], "chat");
    wait_snapshot(&h.store, |s| s.turn_in_flight).await;
    turn
}

fn assistant_with_call(id: &str, ts: u64) -> serde_json::Value {
    json!({
        "role": "assistant",
        "content": "",
        "toolCallsJson": format!("[{{\"id\":\"{id}\",\"tool_name\":\"search\",\"parameters\":\"{{}}\"}}]"),
        "toolResultsJson": null,
        "timestamp": ts
    })
}

fn tool_result(id: &str, ts: u64) -> serde_json::Value {
    json!({
        "role": "tool",
        "content": "Tool execution results",
        "toolResultsJson": format!("[{{\"tool_call_id\":\"{id}\",\"result\":\"ok\"}}]"),
        "timestamp": ts
    })
}

// =============================================================================
// TURN LIFECYCLE
// =============================================================================

#[tokio::test]
async fn full_turn_with_tool_call_assigns_conversation_id() {
    let mut h = ready().await;
    let turn = spawn_send(&h.session, "hi");

    let chat = h.peer.recv().await;
    assert_eq!(chat["type"], "chat");
    let payload = &chat["payload"];
    assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    assert_eq!(payload["messages"][0]["role"], "user");
    assert_eq!(payload["messages"][0]["content"], "hi");
    assert_eq!(payload["llmProvider"], "anthropic");
    assert_eq!(payload["mcpServers"], json!(["fs"]));
    assert_eq!(payload["metadata"]["client"], "test");

    let snapshot = wait_snapshot(&h.store, |s| s.turn_in_flight).await;
    assert_eq!(snapshot.message_count(), 1);
    assert_eq!(snapshot.conversation.unwrap().messages[0].role, Role::User);

    h.peer.push(json!({"type": "message", "message": assistant_with_call("t1", 100)}));
    let snapshot = wait_snapshot(&h.store, |s| s.message_count() == 2).await;
    assert_eq!(snapshot.conversation.unwrap().messages[1].calls()[0].id, "t1");

    let user = &payload["messages"][0];
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {
            "conversationId": "c1",
            "response": {"role": "assistant", "content": "done", "timestamp": 102},
            "allMessages": [
                user,
                assistant_with_call("t1", 100),
                tool_result("t1", 101),
                {"role": "assistant", "content": "done", "timestamp": 102}
            ]
        }
    }));

    let TurnOutcome::Completed { conversation_id, response } = outcome(turn).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(conversation_id, "c1");
    assert_eq!(response.content, "done");

    let conversation = h.session.conversation().await.unwrap();
    assert_eq!(conversation.id.as_deref(), Some("c1"));
    assert_eq!(conversation.messages.len(), 4);
    assert_eq!(conversation.messages[2].results()[0].tool_call_id, "t1");
    assert!(!h.store.snapshot().turn_in_flight);
}

#[tokio::test]
async fn second_turn_keeps_conversation_id_and_sends_full_history() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "first").await;
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c1", "response": {"role": "assistant", "content": "one", "timestamp": 5}}
    }));
    outcome(turn).await.unwrap();

    let turn = spawn_send(&h.session, "second");
    let chat = h.peer.recv().await;
    let contents: Vec<&str> =
        chat["payload"]["messages"].as_array().unwrap().iter().map(|m| m["content"].as_str().unwrap()).collect();
    assert_eq!(contents, vec!["first", "one", "second"]);
    wait_snapshot(&h.store, |s| s.turn_in_flight).await;

    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "other", "response": {"role": "assistant", "content": "two", "timestamp": 9}}
    }));
    outcome(turn).await.unwrap();
    assert_eq!(h.session.conversation().await.unwrap().id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn streamed_update_replaces_last_message() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    h.peer.push(json!({"type": "message", "message": {"role": "assistant", "content": "par", "timestamp": 50}}));
    wait_snapshot(&h.store, |s| s.message_count() == 2).await;
    h.peer.push(json!({"type": "message", "message": {"role": "assistant", "content": "partial answer", "timestamp": 50}}));
    let snapshot = wait_snapshot(&h.store, |s| {
        s.conversation.as_ref().is_some_and(|c| c.messages.last().is_some_and(|m| m.content == "partial answer"))
    })
    .await;
    assert_eq!(snapshot.message_count(), 2);

    // Response already applied: not duplicated.
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c2", "response": {"role": "assistant", "content": "partial answer", "timestamp": 50}}
    }));
    outcome(turn).await.unwrap();
    assert_eq!(h.session.conversation().await.unwrap().messages.len(), 2);
}

#[tokio::test]
async fn tool_result_for_unknown_call_is_dropped() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    h.peer.push(json!({"type": "message", "message": tool_result("ghost", 60)}));
    h.peer.push(json!({"type": "message", "message": assistant_with_call("t1", 61)}));
    h.peer.push(json!({"type": "message", "message": tool_result("t1", 62)}));
    wait_snapshot(&h.store, |s| s.message_count() == 3).await;

    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c3", "response": {"role": "assistant", "content": "fin", "timestamp": 63}}
    }));
    outcome(turn).await.unwrap();

    let conversation = h.session.conversation().await.unwrap();
    let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert!(conversation.messages.iter().flat_map(Message::results).all(|r| r.tool_call_id == "t1"));
}

#[tokio::test]
async fn turn_error_keeps_applied_messages() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    h.peer.push(json!({"type": "message", "message": assistant_with_call("t1", 70)}));
    wait_snapshot(&h.store, |s| s.message_count() == 2).await;
    h.peer.push(json!({"type": "error", "error": "model overloaded"}));

    let err = outcome(turn).await.unwrap_err();
    assert!(matches!(&err, SessionError::TurnFailed(reason) if reason == "model overloaded"));
    assert!(err.retryable());

    let snapshot = wait_snapshot(&h.store, |s| !s.turn_in_flight).await;
    assert_eq!(snapshot.message_count(), 2);
    assert_eq!(snapshot.last_error.as_deref(), Some("E_TURN_FAILED: turn failed: model overloaded"));
}

#[tokio::test]
async fn status_and_stream_previews_clear_at_turn_end() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    h.peer.push(json!({"type": "status", "status": "thinking", "message": "step 1"}));
    h.peer.push(json!({"type": "stream", "iteration": 2, "message": "draft", "tool_calls": "[]"}));
    let snapshot = wait_snapshot(&h.store, |s| s.stream.is_some() && s.status.is_some()).await;
    assert_eq!(snapshot.status.as_deref(), Some("thinking: step 1"));
    let stream = snapshot.stream.clone().unwrap();
    assert_eq!((stream.iteration, stream.text.as_str(), stream.tool_calls.as_deref()), (2, "draft", Some("[]")));
    // Previews never touch the conversation.
    assert_eq!(snapshot.message_count(), 1);

    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c4", "response": {"role": "assistant", "content": "x", "timestamp": 1}}
    }));
    outcome(turn).await.unwrap();
    let snapshot = wait_snapshot(&h.store, |s| !s.turn_in_flight).await;
    assert!(snapshot.status.is_none());
    assert!(snapshot.stream.is_none());
}

// =============================================================================
// SINGLE PENDING REQUEST
// =============================================================================

#[tokio::test]
async fn second_send_while_pending_is_rejected_without_duplicate() {
    let mut h = ready().await;
    let _turn = start_turn(&mut h, "one").await;

    let err = h.session.send_user_message("two").await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyPending));
    assert_eq!(err.error_code(), "E_ALREADY_PENDING");

    let conversation = h.session.conversation().await.unwrap();
    assert_eq!(conversation.messages.len(), 1);
    h.peer.assert_silent(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn cancel_clears_pending_and_unblocks_next_turn() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "one").await;

    assert!(h.session.cancel().await);
    assert_eq!(outcome(turn).await.unwrap(), TurnOutcome::Cancelled(CancelReason::Local));
    assert_eq!(h.peer.recv().await, json!({"type": "cancel"}));
    assert!(h.engine.is_ready());
    assert!(!h.store.snapshot().turn_in_flight);

    assert!(!h.session.cancel().await);

    let turn = spawn_send(&h.session, "two");
    let chat = h.peer.recv().await;
    assert_eq!(chat["payload"]["messages"].as_array().unwrap().len(), 2);
    wait_snapshot(&h.store, |s| s.turn_in_flight).await;
    let later = crate::wire::now_secs() + 60;
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c5", "response": {"role": "assistant", "content": "ok", "timestamp": later}}
    }));
    assert!(matches!(outcome(turn).await.unwrap(), TurnOutcome::Completed { .. }));
}

#[tokio::test]
async fn already_cancelled_token_sends_nothing() {
    let mut h = ready().await;
    let token = CancellationToken::new();
    token.cancel();

    let result = h.session.send_user_message_with("hi", token).await;
    assert_eq!(result.unwrap(), TurnOutcome::Cancelled(CancelReason::Local));
    h.peer.assert_silent(Duration::from_millis(50)).await;

    let conversation = h.session.conversation().await.unwrap();
    assert!(conversation.messages.is_empty());
    assert!(!h.store.snapshot().turn_in_flight);
}

#[tokio::test]
async fn late_completion_of_cancelled_turn_is_not_applied_to_next_turn() {
    let mut h = ready().await;
    let first = start_turn(&mut h, "one").await;
    h.session.cancel().await;
    outcome(first).await.unwrap();
    assert_eq!(h.peer.recv().await, json!({"type": "cancel"}));

    let second = start_turn(&mut h, "two").await;
    h.peer.push(json!({"type": "message", "message": {"role": "assistant", "content": "partial one", "timestamp": 1}}));
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "old", "response": {"role": "assistant", "content": "answer to one", "timestamp": 1}}
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    let later = crate::wire::now_secs() + 60;
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c6", "response": {"role": "assistant", "content": "answer to two", "timestamp": later}}
    }));
    let TurnOutcome::Completed { conversation_id, response } = outcome(second).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!((conversation_id.as_str(), response.content.as_str()), ("c6", "answer to two"));

    let contents: Vec<String> =
        h.session.conversation().await.unwrap().messages.into_iter().map(|m| m.content).collect();
    assert_eq!(contents, ["one", "two", "answer to two"]);
}

#[tokio::test]
async fn completion_with_history_of_another_turn_is_dropped() {
    let mut h = ready().await;
    let first = start_turn(&mut h, "one").await;
    h.session.cancel().await;
    outcome(first).await.unwrap();
    h.peer.recv().await;

    let second = start_turn(&mut h, "two").await;
    let user_one = json!({"role": "user", "content": "one", "timestamp": 1});
    let stale = json!({"role": "assistant", "content": "answer to one", "timestamp": 2});
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "old", "response": stale.clone(), "allMessages": [user_one, stale]}
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    let chat = h.session.conversation().await.unwrap();
    let mut all: Vec<serde_json::Value> = chat.messages.iter().map(|m| serde_json::to_value(m).unwrap()).collect();
    let reply = json!({"role": "assistant", "content": "answer to two", "timestamp": 3});
    all.push(reply.clone());
    h.peer.push(json!({
        "type": "chat_complete",
        "payload": {"conversationId": "c7", "response": reply, "allMessages": all}
    }));
    let TurnOutcome::Completed { conversation_id, .. } = outcome(second).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(conversation_id, "c7");
    assert_eq!(h.session.conversation().await.unwrap().messages.len(), 3);
}

#[tokio::test]
async fn caller_token_cancels_turn() {
    let mut h = ready().await;
    let token = CancellationToken::new();
    let turn = {
        let session = h.session.clone();
        let token = token.clone();
        tokio::spawn(async move { session.send_user_message_with("hi", token).await })
    };
    h.peer.recv().await;
    wait_snapshot(&h.store, |s| s.turn_in_flight).await;

    token.cancel();
    assert_eq!(outcome(turn).await.unwrap(), TurnOutcome::Cancelled(CancelReason::Local));
    assert_eq!(h.peer.recv().await, json!({"type": "cancel"}));
    wait_snapshot(&h.store, |s| !s.turn_in_flight).await;
}

#[tokio::test]
async fn dropping_the_turn_future_cancels_it() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    turn.abort();
    assert_eq!(h.peer.recv().await, json!({"type": "cancel"}));
    wait_snapshot(&h.store, |s| !s.turn_in_flight).await;

    let next = start_turn(&mut h, "again").await;
    assert!(!next.is_finished());
}

#[tokio::test]
async fn envelopes_after_cancel_do_not_touch_conversation() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;
    h.session.cancel().await;
    outcome(turn).await.unwrap();
    h.peer.recv().await;

    h.peer.push(json!({"type": "message", "message": {"role": "assistant", "content": "late", "timestamp": 4}}));
    h.peer.push(json!({"type": "chat_complete", "payload": {"conversationId": "late", "response": {"role": "assistant", "content": "late", "timestamp": 4}}}));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conversation = h.session.conversation().await.unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert!(conversation.id.is_none());
}

// =============================================================================
// CONNECTIVITY
// =============================================================================

#[tokio::test]
async fn send_before_auth_is_not_ready_but_message_stays() {
    let (_engine, _peer, session, store) = connected(Vec::new()).await;

    let err = session.send_user_message("hello?").await.unwrap_err();
    assert!(matches!(err, SessionError::NotReady));

    let snapshot = store.snapshot();
    assert_eq!(snapshot.message_count(), 1);
    assert!(!snapshot.turn_in_flight);
    assert_eq!(snapshot.last_error.as_deref(), Some("E_NOT_READY: connection is not authenticated"));
}

#[tokio::test]
async fn invalid_credential_leaves_connection_open() {
    let (engine, mut peer, session, store) = connected(Vec::new()).await;
    let auth = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.authenticate(&Credential::new("bad")).await })
    };
    peer.recv().await;
    peer.push(json!({"type": "auth_error", "error": "unknown key"}));

    assert_eq!(auth.await.unwrap().unwrap_err(), crate::engine::AuthError::Rejected("unknown key".to_owned()));
    assert_eq!(engine.state(), ConnectionState::Open);
    wait_snapshot(&store, |s| s.connection == ConnectionState::Open).await;
    assert!(matches!(session.send_user_message("x").await, Err(SessionError::NotReady)));
}

#[tokio::test(start_paused = true)]
async fn connection_loss_mid_turn_cancels_and_schedules_reconnect() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    let closed_at = Instant::now();
    h.peer.close();

    assert_eq!(outcome(turn).await.unwrap(), TurnOutcome::Cancelled(CancelReason::ConnectionLost));
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
    assert_eq!(h.engine.reconnect_deadline().await, Some(closed_at + Duration::from_secs(3)));

    let snapshot = wait_snapshot(&h.store, |s| s.connection == ConnectionState::Disconnected).await;
    assert!(!snapshot.turn_in_flight);
    assert_eq!(snapshot.message_count(), 1);

    // Not Ready until re-authenticated.
    assert!(matches!(h.session.send_user_message("again").await, Err(SessionError::NotReady)));
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

fn stored(id: &str) -> Conversation {
    let mut conversation = Conversation::new(
        ConversationMetadata { start_time: "2026-03-01T00:00:00Z".to_owned(), client: "test".to_owned(), from_stt: false },
        "anthropic",
        Vec::new(),
    );
    conversation.id = Some(id.to_owned());
    conversation.messages.push(Message::user("from history"));
    conversation
}

#[tokio::test]
async fn new_conversation_cancels_turn_and_starts_empty() {
    let mut h = ready().await;
    let turn = start_turn(&mut h, "hi").await;

    h.session.new_conversation().await.unwrap();
    assert_eq!(outcome(turn).await.unwrap(), TurnOutcome::Cancelled(CancelReason::Local));
    assert_eq!(h.peer.recv().await, json!({"type": "cancel"}));

    let conversation = h.session.conversation().await.unwrap();
    assert!(conversation.messages.is_empty());
    assert!(conversation.id.is_none());
    assert_eq!(conversation.metadata.client, "test");
}

#[tokio::test]
async fn load_conversation_replaces_active_one() {
    let h = ready_with(vec![stored("c9")]).await;
    h.session.load_conversation("c9").await.unwrap();

    let snapshot = h.store.snapshot();
    let conversation = snapshot.conversation.unwrap();
    assert_eq!(conversation.id.as_deref(), Some("c9"));
    assert_eq!(conversation.messages[0].content, "from history");
}

#[tokio::test]
async fn load_missing_conversation_is_not_found() {
    let h = ready().await;
    let err = h.session.load_conversation("nope").await.unwrap_err();
    assert!(matches!(&err, SessionError::NotFound(id) if id == "nope"));
    assert_eq!(h.session.conversation().await.unwrap().messages.len(), 0);
}

#[tokio::test]
async fn load_while_pending_is_rejected() {
    let mut h = ready_with(vec![stored("c9")]).await;
    let _turn = start_turn(&mut h, "hi").await;
    assert!(matches!(h.session.load_conversation("c9").await, Err(SessionError::AlreadyPending)));
    assert_eq!(h.session.conversation().await.unwrap().messages[0].content, "hi");
}

#[tokio::test]
async fn list_history_publishes_to_store() {
    let h = ready_with(vec![stored("a"), stored("b")]).await;
    let listed = h.session.list_history(HistoryFilter { limit: Some(1), ..HistoryFilter::default() }).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(h.store.snapshot().history, listed);
}
