//! Initial task-context prompt for a fresh conversation.

use crate::models::Task;

/// The two texts that open a conversation with no resumption token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPrompt {
    /// Recorded as a `system` message; describes what the session is about.
    pub context: String,
    /// Recorded as the `user` message and written to the agent.
    pub prompt: String,
}

impl TaskPrompt {
    /// Build the opening prompt for `task`.
    pub fn for_task(task: &Task) -> Self {
        let context = format!("Started session for task {} ({})", task.id, task.title);

        let body = task.raw_content.trim();
        let prompt = if body.is_empty() {
            format!(
                "You are working on task \"{}\" (id: {}). The task file is empty; \
                 ask what needs to be done.",
                task.title, task.id
            )
        } else {
            format!(
                "You are working on task \"{}\" (id: {}). Here is the task file:\n\n{}\n\n\
                 Read it, then tell me your plan before making changes.",
                task.title, task.id, body
            )
        };

        Self { context, prompt }
    }
}
