//! Tasklane core types.
//!
//! Identifiers, lifecycle states, events, errors, the listener registry,
//! resource lookup and configuration shared by the execution and progress
//! crates.

#![warn(missing_docs)]

mod id;
mod state;
mod event;

pub mod error;
pub mod listener;
pub mod resource;
pub mod config;

// Re-exports
pub use id::{ListenerId, TaskId};
pub use state::{BlockingScope, TaskState};
pub use event::{TaskEvent, TaskEventPayload};

pub use error::{BlockError, ConfigError, ResourceError, TaskError, UsageError};
pub use listener::{Callback, Listeners};
pub use resource::{format_message, MapResources, ResourceMap};
pub use config::{AppConfig, PoolConfig, DEFAULT_SERVICE_NAME};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
