//! Message model representing one entry in a session transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Message from the agent.
    Assistant,
    /// Message generated by taskdeck itself (context, errors).
    System,
}

impl MessageRole {
    /// Convert role to its wire string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message in a session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier (UUIDv7: time-ordered plus random bits).
    pub id: String,
    /// Role of the message sender.
    pub role: MessageRole,
    /// Content of the message; assistant messages grow while streaming.
    pub content: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Whether the agent is still writing into this message.
    pub streaming: bool,
}

impl Message {
    /// Create a complete message.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
        }
    }

    /// Create an empty assistant message that output will stream into.
    pub fn assistant_placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::new(MessageRole::Assistant, String::new())
        }
    }
}
