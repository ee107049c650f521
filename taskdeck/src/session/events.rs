//! Session events: the unified stream every subscriber sees.

use serde::{Deserialize, Serialize};

use crate::models::{Message, Session};

/// An event emitted by the session manager, scoped by task.
///
/// For one task the order is always `session-started`, then any mix of
/// `message` and `stream`, then `stream-end` (if a reply was in flight),
/// then `session-ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// An agent run started.
    SessionStarted {
        /// Task id.
        task_id: String,
        /// Whether the run resumes an earlier conversation.
        resumed: bool,
    },
    /// A message was appended to the transcript.
    Message {
        /// Task id.
        task_id: String,
        /// The message as appended.
        message: Message,
    },
    /// Output was appended to a streaming message.
    Stream {
        /// Task id.
        task_id: String,
        /// Target message.
        message_id: String,
        /// Appended text.
        delta: String,
    },
    /// A streaming message is complete.
    StreamEnd {
        /// Task id.
        task_id: String,
        /// Completed message.
        message_id: String,
    },
    /// The agent run ended.
    SessionEnded {
        /// Task id.
        task_id: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Terminating signal, if killed.
        signal: Option<i32>,
    },
    /// The session and its transcript were deleted.
    SessionCleared {
        /// Task id.
        task_id: String,
    },
    /// A spawn or runtime failure of the agent.
    Error {
        /// Task id.
        task_id: String,
        /// Description of the failure.
        error: String,
    },
}

impl SessionEvent {
    /// Task the event belongs to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::SessionStarted { task_id, .. }
            | Self::Message { task_id, .. }
            | Self::Stream { task_id, .. }
            | Self::StreamEnd { task_id, .. }
            | Self::SessionEnded { task_id, .. }
            | Self::SessionCleared { task_id }
            | Self::Error { task_id, .. } => task_id,
        }
    }

    /// Wire name of the event (the serde tag).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session-started",
            Self::Message { .. } => "message",
            Self::Stream { .. } => "stream",
            Self::StreamEnd { .. } => "stream-end",
            Self::SessionEnded { .. } => "session-ended",
            Self::SessionCleared { .. } => "session-cleared",
            Self::Error { .. } => "error",
        }
    }
}

impl Session {
    /// Fold one event into a client-side copy of the session.
    ///
    /// Replaying a task's events from a snapshot reproduces the transcript
    /// the manager holds. Events for other tasks are ignored.
    pub fn apply_event(&mut self, event: &SessionEvent) {
        if event.task_id() != self.task_id {
            return;
        }
        match event {
            SessionEvent::SessionStarted { .. } => {
                self.active = true;
                self.touch();
            }
            SessionEvent::Message { message, .. } => {
                if self.message(&message.id).is_none() {
                    self.push(message.clone());
                }
            }
            SessionEvent::Stream {
                message_id, delta, ..
            } => {
                self.append_content(message_id, delta);
            }
            SessionEvent::StreamEnd { message_id, .. } => {
                self.end_streaming(message_id);
            }
            SessionEvent::SessionEnded { .. } => {
                self.active = false;
                self.touch();
            }
            SessionEvent::SessionCleared { .. } => {
                self.messages.clear();
                self.resumption_token = None;
                self.active = false;
            }
            SessionEvent::Error { .. } => self.touch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    #[test]
    fn test_wire_format_is_tagged() {
        let event = SessionEvent::StreamEnd {
            task_id: "T1".to_string(),
            message_id: "m1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream-end");
        assert_eq!(json["task_id"], "T1");
        assert_eq!(json["message_id"], "m1");
        assert_eq!(event.name(), "stream-end");

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_fold_rebuilds_transcript() {
        let mut session = Session::new("T1");
        let placeholder = Message::assistant_placeholder();
        let events = [
            SessionEvent::SessionStarted {
                task_id: "T1".to_string(),
                resumed: false,
            },
            SessionEvent::Message {
                task_id: "T1".to_string(),
                message: Message::new(MessageRole::User, "hi"),
            },
            SessionEvent::Message {
                task_id: "T1".to_string(),
                message: placeholder.clone(),
            },
            SessionEvent::Stream {
                task_id: "T1".to_string(),
                message_id: placeholder.id.clone(),
                delta: "Hel".to_string(),
            },
            SessionEvent::Stream {
                task_id: "OTHER".to_string(),
                message_id: placeholder.id.clone(),
                delta: "!!!".to_string(),
            },
            SessionEvent::Stream {
                task_id: "T1".to_string(),
                message_id: placeholder.id.clone(),
                delta: "lo".to_string(),
            },
            SessionEvent::StreamEnd {
                task_id: "T1".to_string(),
                message_id: placeholder.id.clone(),
            },
            SessionEvent::SessionEnded {
                task_id: "T1".to_string(),
                exit_code: Some(0),
                signal: None,
            },
        ];
        for event in &events {
            session.apply_event(event);
        }

        assert!(!session.active);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "Hello");
        assert!(!session.messages[1].streaming);
    }
}
