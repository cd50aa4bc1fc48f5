//! On-disk conversation history for the CLI.
//!
//! The streaming pipeline only reads a [`Conversation`] handed to it; this
//! crate is what keeps one around between invocations.

use std::path::{Path, PathBuf};

use pal_core::messages::{Conversation, Message};
use tracing::debug;

pub const CONVERSATION_FILE: &str = "conversation.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A single conversation persisted as JSON.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    /// Store rooted at `dir`; the file itself is `dir/conversation.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::at(dir.join(CONVERSATION_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file is an empty conversation.
    pub fn load(&self) -> Result<Conversation> {
        if !self.path.exists() {
            return Ok(Conversation::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Conversation::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, conversation: &Conversation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(conversation)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, messages = conversation.len(), "conversation saved");
        Ok(())
    }

    /// Load, push, save. Returns the new length.
    pub fn append(&self, messages: impl IntoIterator<Item = Message>) -> Result<usize> {
        let mut conversation = self.load()?;
        for message in messages {
            conversation.push(message);
        }
        self.save(&conversation)?;
        Ok(conversation.len())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
