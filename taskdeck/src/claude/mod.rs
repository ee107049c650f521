//! Claude CLI interaction module.

mod framer;
mod launcher;

pub use framer::{ContentDelta, FinishedRun, FramedChunk, OutputFramer};
pub use launcher::{
    AgentInvocation, AgentLauncher, AgentProcess, ClaudeLauncher, ClaudeOptions, TASK_ID_ENV,
};
