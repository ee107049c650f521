//! Claude CLI process launching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::error::ProcessError;
use crate::process::{ProcessEvent, ProcessHandle, ProcessOptions};

/// Environment variable carrying the task id into the agent's environment.
pub const TASK_ID_ENV: &str = "TASKDECK_TASK_ID";

/// A running agent as seen by the session manager.
pub trait AgentProcess: Send + Sync + std::fmt::Debug {
    /// OS process id, if launched.
    fn pid(&self) -> Option<u32>;

    /// Send one line of input.
    fn write(&self, text: &str) -> Result<(), ProcessError>;

    /// Request termination, escalating after `graceful_timeout`.
    fn kill(&self, graceful_timeout: Duration);
}

impl AgentProcess for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        Self::pid(self)
    }

    fn write(&self, text: &str) -> Result<(), ProcessError> {
        Self::write(self, text)
    }

    fn kill(&self, graceful_timeout: Duration) {
        Self::kill(self, graceful_timeout);
    }
}

/// Everything needed to start one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Task the run belongs to.
    pub task_id: String,
    /// Spawn cwd.
    pub working_dir: PathBuf,
    /// Token from a previous run, if the conversation is being resumed.
    pub resume_token: Option<String>,
}

/// Starts agent processes.
///
/// Launch failures are never returned directly; they arrive on the event
/// channel as an `Error` followed by an `Exit`.
pub trait AgentLauncher: Send + Sync {
    /// Start an agent for `invocation`.
    fn launch(
        &self,
        invocation: &AgentInvocation,
    ) -> (Box<dyn AgentProcess>, mpsc::UnboundedReceiver<ProcessEvent>);
}

/// Options for spawning Claude.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeOptions {
    /// Executable name or path.
    pub program: String,
    /// Flag that skips interactive permission prompts.
    pub skip_permissions_flag: String,
    /// Flag that precedes the resumption token.
    pub resume_flag: String,
    /// Additional arguments appended after the fixed flags.
    pub extra_args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl Default for ClaudeOptions {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            skip_permissions_flag: "--dangerously-skip-permissions".to_string(),
            resume_flag: "--resume".to_string(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Launches the Claude CLI in plain-text mode over piped stdio.
///
/// This runs:
/// `claude --dangerously-skip-permissions [--resume <token>] [extra args]`
#[derive(Debug, Clone, Default)]
pub struct ClaudeLauncher {
    options: ClaudeOptions,
}

impl ClaudeLauncher {
    /// Create a launcher with the given options.
    pub const fn new(options: ClaudeOptions) -> Self {
        Self { options }
    }

    /// Build the process options for one run.
    pub fn process_options(&self, invocation: &AgentInvocation) -> ProcessOptions {
        let mut opts = ProcessOptions::new(&self.options.program);

        // Always skip permission prompts; nobody is at a terminal.
        opts = opts.arg(&self.options.skip_permissions_flag);

        if let Some(ref token) = invocation.resume_token {
            opts = opts.arg(&self.options.resume_flag).arg(token);
        }

        opts.args(self.options.extra_args.iter().cloned())
            .envs(self.options.env.clone())
            .env(TASK_ID_ENV, &invocation.task_id)
            .working_dir(&invocation.working_dir)
    }
}

impl AgentLauncher for ClaudeLauncher {
    fn launch(
        &self,
        invocation: &AgentInvocation,
    ) -> (Box<dyn AgentProcess>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let opts = self.process_options(invocation);
        let (handle, events) = ProcessHandle::spawn(&opts);
        info!(
            task_id = %invocation.task_id,
            pid = ?handle.pid(),
            resumed = invocation.resume_token.is_some(),
            "launched agent"
        );
        (Box::new(handle), events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(token: Option<&str>) -> AgentInvocation {
        AgentInvocation {
            task_id: "T1".to_string(),
            working_dir: PathBuf::from("/tmp"),
            resume_token: token.map(String::from),
        }
    }

    #[test]
    fn test_fresh_run_args() {
        let launcher = ClaudeLauncher::default();
        let opts = launcher.process_options(&invocation(None));

        assert_eq!(opts.program, "claude");
        assert_eq!(opts.args, vec!["--dangerously-skip-permissions"]);
        assert_eq!(opts.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(opts.env.get(TASK_ID_ENV).map(String::as_str), Some("T1"));
    }

    #[test]
    fn test_resume_passes_token() {
        let launcher = ClaudeLauncher::new(ClaudeOptions {
            extra_args: vec!["--model".to_string(), "sonnet".to_string()],
            ..ClaudeOptions::default()
        });
        let opts = launcher.process_options(&invocation(Some("abc-123")));

        assert_eq!(
            opts.args,
            vec![
                "--dangerously-skip-permissions",
                "--resume",
                "abc-123",
                "--model",
                "sonnet"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error_event() {
        let launcher = ClaudeLauncher::new(ClaudeOptions {
            program: "definitely-not-claude-12345".to_string(),
            ..ClaudeOptions::default()
        });
        let (process, mut events) = launcher.launch(&invocation(None));

        assert!(process.pid().is_none());
        assert!(matches!(events.recv().await, Some(ProcessEvent::Error(_))));
        assert!(matches!(events.recv().await, Some(ProcessEvent::Exit(_))));
    }
}
