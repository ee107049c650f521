//! Error types for the session engine.

use thiserror::Error;

/// Errors returned synchronously by [`SessionManager`](crate::session::SessionManager)
/// operations.
///
/// Failures of the agent process itself never surface here; they arrive as
/// scoped `error` events on the event stream.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another task already holds the single agent slot.
    #[error("another session is active for task {active_task_id}; stop it first")]
    Conflict {
        /// Task currently bound to the running agent.
        active_task_id: String,
    },

    /// The task store does not know this id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No running agent is bound to this task.
    #[error("no active session for task {0}")]
    NoActiveSession(String),

    /// The agent is still streaming its previous reply.
    #[error("agent for task {0} is still responding")]
    Busy(String),

    /// The task store failed while looking up a task.
    #[error("task lookup failed: {0}")]
    TaskSource(#[source] anyhow::Error),
}

impl SessionError {
    /// Short machine-readable label, used in API error bodies.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "session_conflict",
            Self::TaskNotFound(_) => "task_not_found",
            Self::NoActiveSession(_) => "no_active_session",
            Self::Busy(_) => "busy",
            Self::TaskSource(_) => "task_source",
        }
    }
}

/// Errors raised by a [`ProcessHandle`](crate::process::ProcessHandle).
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was being launched.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The process has already exited; its stdin is closed.
    #[error("process has already exited")]
    Exited,
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
