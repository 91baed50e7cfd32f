//! Conversation history collaborator.
//!
//! The session manager only lists and fetches; writing history belongs to
//! whoever owns persistence. Two sources ship here: an in-memory one for
//! tests and embedding, and a directory of `<id>.json` files in the shape
//! the backend persists conversations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::wire::Conversation;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("conversation `{0}` not found")]
    NotFound(String),
    #[error("conversation has no id")]
    MissingId,
    #[error("invalid conversation id `{0}`")]
    InvalidId(String),
    #[error("history io: {0}")]
    Io(#[from] std::io::Error),
    #[error("history file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Listing parameters. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Only conversations started by this client tag.
    pub client: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl HistoryFilter {
    fn apply(&self, mut conversations: Vec<Conversation>) -> Vec<Conversation> {
        if let Some(client) = &self.client {
            conversations.retain(|c| &c.metadata.client == client);
        }
        // RFC 3339 UTC timestamps sort lexically.
        conversations.sort_by(|a, b| b.metadata.start_time.cmp(&a.metadata.start_time));
        conversations
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn list(&self, filter: &HistoryFilter) -> Result<Vec<Conversation>, HistoryError>;

    /// # Errors
    ///
    /// [`HistoryError::NotFound`] when no conversation has `id`.
    async fn get(&self, id: &str) -> Result<Conversation, HistoryError>;
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryHistory {
    conversations: RwLock<Vec<Conversation>>,
}

impl MemoryHistory {
    #[must_use]
    pub fn new(conversations: Vec<Conversation>) -> Self {
        Self { conversations: RwLock::new(conversations) }
    }

    /// Insert or replace by id.
    ///
    /// # Errors
    ///
    /// [`HistoryError::MissingId`] for an unsaved conversation.
    pub async fn save(&self, conversation: Conversation) -> Result<(), HistoryError> {
        let id = conversation.id.clone().ok_or(HistoryError::MissingId)?;
        let mut all = self.conversations.write().await;
        all.retain(|c| c.id.as_deref() != Some(id.as_str()));
        all.push(conversation);
        Ok(())
    }
}

#[async_trait]
impl HistorySource for MemoryHistory {
    async fn list(&self, filter: &HistoryFilter) -> Result<Vec<Conversation>, HistoryError> {
        Ok(filter.apply(self.conversations.read().await.clone()))
    }

    async fn get(&self, id: &str) -> Result<Conversation, HistoryError> {
        self.conversations
            .read()
            .await
            .iter()
            .find(|c| c.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(id.to_owned()))
    }
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// One `<id>.json` file per conversation.
#[derive(Debug, Clone)]
pub struct DirHistory {
    dir: PathBuf,
}

impl DirHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `conversation` to `<id>.json`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// [`HistoryError::MissingId`] for an unsaved conversation,
    /// [`HistoryError::InvalidId`] for an id that is not a plain file name, or
    /// the underlying io failure.
    pub async fn save(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        let id = conversation.id.as_deref().ok_or(HistoryError::MissingId)?;
        let path = self.path_for(id).ok_or_else(|| HistoryError::InvalidId(id.to_owned()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(conversation)
            .map_err(|source| HistoryError::Parse { path: path.clone(), source })?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    /// `None` for ids that would escape the directory.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\']);
        safe.then(|| self.dir.join(format!("{id}.json")))
    }

    async fn read(path: &Path) -> Result<Conversation, HistoryError> {
        let bytes = tokio::fs::read(path).await?;
        let mut conversation: Conversation =
            serde_json::from_slice(&bytes).map_err(|source| HistoryError::Parse { path: path.to_owned(), source })?;
        if conversation.id.is_none() {
            conversation.id = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned);
        }
        Ok(conversation)
    }
}

#[async_trait]
impl HistorySource for DirHistory {
    async fn list(&self, filter: &HistoryFilter) -> Result<Vec<Conversation>, HistoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(conversation) => found.push(conversation),
                Err(e) => warn!(error = %e, "history: skipping unreadable file"),
            }
        }
        Ok(filter.apply(found))
    }

    async fn get(&self, id: &str) -> Result<Conversation, HistoryError> {
        let path = self.path_for(id).ok_or_else(|| HistoryError::NotFound(id.to_owned()))?;
        match Self::read(&path).await {
            Err(HistoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HistoryError::NotFound(id.to_owned()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
