//! Data models for taskdeck entities.

mod message;
mod session;
mod task;

pub use message::{Message, MessageRole};
pub use session::Session;
pub use task::Task;
