//! Session model: one task's conversation and process binding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// A session is the record of one task's conversation with the agent.
///
/// It outlives agent runs: when a run ends, `active` flips to false while the
/// messages and resumption token stay for the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Task this session belongs to.
    pub task_id: String,
    /// Token issued by the agent for continuing the conversation.
    pub resumption_token: Option<String>,
    /// Transcript in chronological order.
    pub messages: Vec<Message>,
    /// Whether an agent process is currently bound to this task.
    pub active: bool,
    /// When the current (or most recent) run started.
    pub started_at: DateTime<Utc>,
    /// Last state change.
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty, inactive session.
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            resumption_token: None,
            messages: Vec::new(),
            active: false,
            started_at: now,
            last_activity_at: now,
        }
    }

    /// Look up a message by id.
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.id == id)
    }

    /// The assistant message currently being streamed, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.streaming)
    }

    /// Refresh `last_activity_at`.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Append a message and return a copy of it.
    pub fn push(&mut self, message: Message) -> Message {
        self.touch();
        self.messages.push(message.clone());
        message
    }

    /// Append text to a message. Returns false if the message is unknown.
    pub fn append_content(&mut self, id: &str, text: &str) -> bool {
        let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) else {
            return false;
        };
        message.content.push_str(text);
        self.touch();
        true
    }

    /// Mark a message as no longer streaming.
    ///
    /// Returns true only on the transition, so each message ends exactly once.
    pub fn end_streaming(&mut self, id: &str) -> bool {
        let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) else {
            return false;
        };
        if !message.streaming {
            return false;
        }
        message.streaming = false;
        self.touch();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    #[test]
    fn test_append_and_end_streaming() {
        let mut session = Session::new("T1");
        session.push(Message::new(MessageRole::User, "hi"));
        let placeholder = session.push(Message::assistant_placeholder());

        assert_eq!(session.streaming_message().map(|m| m.id.as_str()), Some(placeholder.id.as_str()));
        assert!(session.append_content(&placeholder.id, "Hel"));
        assert!(session.append_content(&placeholder.id, "lo"));
        assert_eq!(session.message(&placeholder.id).unwrap().content, "Hello");

        assert!(session.end_streaming(&placeholder.id));
        assert!(!session.end_streaming(&placeholder.id));
        assert!(session.streaming_message().is_none());
    }

    #[test]
    fn test_unknown_message_is_ignored() {
        let mut session = Session::new("T1");
        assert!(!session.append_content("nope", "x"));
        assert!(!session.end_streaming("nope"));
    }

    #[test]
    fn test_push_preserves_order() {
        let mut session = Session::new("T1");
        let a = session.push(Message::new(MessageRole::System, "a"));
        let b = session.push(Message::new(MessageRole::User, "b"));
        let ids: Vec<_> = session.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }
}
