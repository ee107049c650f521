//! Agent process supervision.
//!
//! Provides a spawn configuration builder and a supervised handle with:
//! - Fully piped stdio
//! - Ordered raw output streaming via a channel
//! - Line writes to stdin
//! - Graceful termination with forced-kill escalation

mod handle;
mod options;

pub use handle::{ExitInfo, OutputStream, ProcessEvent, ProcessHandle, GRACEFUL_KILL_TIMEOUT};
pub use options::ProcessOptions;
