//! Wire envelopes and conversation types for the streaming session protocol.
//!
//! DESIGN
//! ======
//! Every unit on the connection is a JSON object discriminated by `type`.
//! Client and server directions get separate enums so a frame can only be
//! built for the direction it travels. Tool calls and tool results ride
//! inside a message as JSON-encoded strings (`toolCallsJson`,
//! `toolResultsJson`); the Rust side keeps them as typed lists and converts
//! at the serde boundary.
//!
//! Decoding failures are `ProtocolError`s. The engine logs and drops them;
//! they never tear down a connection.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// ERRORS
// =============================================================================

/// A frame or message that violates the protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The bytes were not a JSON envelope of a known `type`.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A tool result points at a tool call the conversation has never seen.
    #[error("tool result references unknown tool call `{0}`")]
    UnknownToolCall(String),
    /// A tool call reuses an id already present in the conversation.
    #[error("duplicate tool call id `{0}`")]
    DuplicateToolCall(String),
}

// =============================================================================
// CONVERSATION MODEL
// =============================================================================

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    /// Serialized parameters, opaque to this crate.
    pub parameters: String,
}

/// Output of a tool call, keyed by the call's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    /// Serialized result, opaque to this crate.
    pub result: String,
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "toolCallsJson", default, with = "json_string")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(rename = "toolResultsJson", default, with = "json_string")]
    pub tool_results: Option<Vec<ToolResult>>,
    /// Unix seconds.
    pub timestamp: u64,
}

impl Message {
    /// Build a plain user message stamped with the current time.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_calls: None, tool_results: None, timestamp: now_secs() }
    }

    /// Tool calls carried by this message, empty when none.
    #[must_use]
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// Tool results carried by this message, empty when none.
    #[must_use]
    pub fn results(&self) -> &[ToolResult] {
        self.tool_results.as_deref().unwrap_or_default()
    }
}

/// Descriptive data attached to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    /// RFC 3339 timestamp of the first turn.
    #[serde(rename = "startTime")]
    pub start_time: String,
    /// Tag of the client that started the conversation.
    pub client: String,
    #[serde(rename = "fromStt", default)]
    pub from_stt: bool,
}

impl ConversationMetadata {
    /// Metadata for a conversation starting now.
    #[must_use]
    pub fn starting_now(client: impl Into<String>) -> Self {
        let start_time = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        Self { start_time, client: client.into(), from_stt: false }
    }
}

/// An ordered message sequence plus the settings it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-assigned id; `None` until the first turn completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub messages: Vec<Message>,
    pub metadata: ConversationMetadata,
    #[serde(rename = "llmProvider")]
    pub llm_provider: String,
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: Vec<String>,
}

impl Conversation {
    /// An empty, unsaved conversation.
    #[must_use]
    pub fn new(metadata: ConversationMetadata, llm_provider: impl Into<String>, mcp_servers: Vec<String>) -> Self {
        Self { id: None, messages: Vec::new(), metadata, llm_provider: llm_provider.into(), mcp_servers }
    }

    /// Check that `message` can join this conversation.
    ///
    /// Every tool result must reference a tool call carried by an earlier
    /// message or by `message` itself, and new tool call ids must not collide
    /// with existing ones. When `replacing_last` is set the last message is
    /// about to be overwritten, so its calls do not count.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownToolCall`] or
    /// [`ProtocolError::DuplicateToolCall`].
    pub fn check_message(&self, message: &Message, replacing_last: bool) -> Result<(), ProtocolError> {
        let kept = if replacing_last {
            &self.messages[..self.messages.len().saturating_sub(1)]
        } else {
            &self.messages[..]
        };

        let mut known: HashSet<&str> = kept.iter().flat_map(Message::calls).map(|c| c.id.as_str()).collect();
        for call in message.calls() {
            if !known.insert(call.id.as_str()) {
                return Err(ProtocolError::DuplicateToolCall(call.id.clone()));
            }
        }
        for result in message.results() {
            if !known.contains(result.tool_call_id.as_str()) {
                return Err(ProtocolError::UnknownToolCall(result.tool_call_id.clone()));
            }
        }
        Ok(())
    }
}

/// Terminal payload of a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub response: Message,
    /// Full message list as the server sees it after the turn.
    #[serde(rename = "allMessages", default)]
    pub all_messages: Vec<Message>,
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// Body of a `chat` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<Message>,
    #[serde(rename = "llmProvider", default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(rename = "mcpServers", default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ConversationMetadata>,
}

impl ChatPayload {
    /// Build the request for the next turn of `conversation`.
    #[must_use]
    pub fn for_conversation(conversation: &Conversation) -> Self {
        Self {
            messages: conversation.messages.clone(),
            llm_provider: Some(conversation.llm_provider.clone()),
            mcp_servers: (!conversation.mcp_servers.is_empty()).then(|| conversation.mcp_servers.clone()),
            metadata: Some(conversation.metadata.clone()),
        }
    }
}

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Chat {
        payload: ChatPayload,
    },
    Cancel,
    Ping,
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    AuthSuccess {
        #[serde(default)]
        message: String,
    },
    AuthError {
        #[serde(default)]
        error: String,
    },
    Status {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    Stream {
        iteration: u32,
        message: String,
        #[serde(default)]
        tool_calls: Option<String>,
    },
    Message {
        message: Message,
    },
    ChatComplete {
        payload: ChatResponse,
    },
    Error {
        error: String,
    },
    Pong,
}

impl ServerEnvelope {
    /// Envelope `type` tag, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthError { .. } => "auth_error",
            Self::Status { .. } => "status",
            Self::Stream { .. } => "stream",
            Self::Message { .. } => "message",
            Self::ChatComplete { .. } => "chat_complete",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }

    /// Whether this envelope answers an `auth` request.
    #[must_use]
    pub fn is_auth_reply(&self) -> bool {
        matches!(self, Self::AuthSuccess { .. } | Self::AuthError { .. })
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a client envelope as JSON bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if serialization fails.
pub fn encode_client(envelope: &ClientEnvelope) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode a server envelope from JSON bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON, an unknown `type`,
/// or a payload that does not match its type.
pub fn decode_server(bytes: &[u8]) -> Result<ServerEnvelope, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Current time as Unix seconds.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Serde adapter for lists carried as JSON-encoded strings.
mod json_string {
    use serde::de::{DeserializeOwned, Error as _};
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => {
                let raw = serde_json::to_string(inner).map_err(S::Error::custom)?;
                serializer.serialize_some(&raw)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.filter(|s| !s.trim().is_empty())
            .map(|s| serde_json::from_str(&s).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[path = "wire_test.rs"]
mod tests;
