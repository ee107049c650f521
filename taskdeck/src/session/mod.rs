//! Interactive agent sessions.
//!
//! The [`SessionManager`] owns one transcript per task and at most one running
//! agent. Everything that happens is announced as a [`SessionEvent`] through an
//! [`EventBroadcaster`].

mod broadcaster;
mod events;
mod manager;
mod prompt;

pub use broadcaster::{EventBroadcaster, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use events::SessionEvent;
pub use manager::{ManagerConfig, SessionManager};
pub use prompt::TaskPrompt;
