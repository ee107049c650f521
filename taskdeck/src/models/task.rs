//! Task model as provided by the task store.

use serde::{Deserialize, Serialize};

/// A task the agent can be started against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// The task file as written, front matter included.
    pub raw_content: String,
}
