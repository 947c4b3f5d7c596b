pub mod config;

pub use config::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to a master's name when their agent speaks on their behalf.
pub const AGENT_SUFFIX: &str = "'s Agent";

/// Render the agent identity for a human master.
pub fn agent_name(master: &str) -> String {
    format!("{master}{AGENT_SUFFIX}")
}

/// One row of the `chats` table. Endpoints may be a human name or
/// `"<name>'s Agent"`; `id` provides the total order used by windowed
/// retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub receiver: String,
    pub message: String,
}

impl ChatRow {
    /// Chat-history line format shared by every rendered context section.
    pub fn render(&self) -> String {
        format!("from {} to {}: {}", self.sender, self.receiver, self.message)
    }

    /// True when either endpoint is an agent rather than a human.
    pub fn involves_agent(&self) -> bool {
        self.sender.contains("Agent") || self.receiver.contains("Agent")
    }
}

/// Append-only record of the agent-to-agent dialogue within one
/// communication. Entry 0 is the task broadcast; each round appends one
/// instructor and one assistant utterance.
#[derive(Debug, Clone, Default)]
pub struct DialogueHistory {
    entries: Vec<String>,
}

impl DialogueHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from messages carried over from an earlier session
    /// (e.g. preloaded multi-party conclusions).
    pub fn with_preloaded(entries: Vec<String>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, sender_master: &str, receiver_master: &str, text: &str) {
        self.entries.push(format!(
            "from {} to {}: {}",
            agent_name(sender_master),
            agent_name(receiver_master),
            text
        ));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazy in-order view over the utterances.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn render(&self) -> String {
        self.entries.join("\n")
    }
}
