//! Taskdeck - run a coding agent against markdown tasks, one at a time.
//!
//! Architecture:
//! - `process` supervises one agent process over piped stdio
//! - `claude` launches the agent and frames its unstructured output
//! - `session` owns the transcripts, the single agent slot and the event fan-out
//! - `server` exposes the session manager over HTTP and SSE
//! - `cli` is a thin client for the server

pub mod claude;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod process;
pub mod server;
pub mod session;
pub mod tasks;

pub use error::{ProcessError, Result, SessionError};
