//! CLI argument parsing and command execution.

mod args;
mod commands;
pub(crate) mod sse;

pub use args::{Cli, Commands};
pub use commands::execute;
