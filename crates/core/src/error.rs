//! Error types.

use crate::id::TaskId;
use crate::state::{BlockingScope, TaskState};

/// Error raised by a task's background work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The work stopped at an interruption point
    #[error("task interrupted")]
    Interrupted,

    /// The work panicked; the payload message is kept
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Build an ad-hoc failure from a message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        TaskError::Other(anyhow::anyhow!("{}", message))
    }

    /// Whether this is the interruption signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}

/// Misuse of the task API, reported straight to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UsageError {
    /// Task was submitted before or is no longer pending
    #[error("task {task} has already been executed (state: {state})")]
    AlreadyExecuted {
        /// The offending task
        task: TaskId,
        /// Its state when the submission was attempted
        state: TaskState,
    },

    /// The service no longer accepts work
    #[error("task service '{0}' is shut down")]
    Rejected(String),

    /// Second input blocker for the same task
    #[error("task {0} already has an input blocker")]
    BlockerAlreadySet(TaskId),

    /// Input blocker created for a different task
    #[error("input blocker belongs to task {blocker_task}, not {task}")]
    BlockerMismatch {
        /// Task the blocker was built for
        blocker_task: TaskId,
        /// Task it was attached to
        task: TaskId,
    },

    /// Service names are unique within a context
    #[error("task service '{0}' already exists")]
    DuplicateService(String),

    /// Lookup of a service that was never registered
    #[error("task service '{0}' not found")]
    UnknownService(String),

    /// Progress range is empty or the value lies outside it
    #[error("invalid progress {value} for range [{min}, {max}]")]
    InvalidProgress {
        /// Reported value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

/// Resource lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// The task was built without a resource map or prefix
    #[error("task has no resource map")]
    NoResourceMap,

    /// The resource map has no entry for the key
    #[error("resource '{0}' not found")]
    MissingKey(String),
}

/// Failure reported by the input-blocking UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// The scope needs a target control and none was given
    #[error("{0} blocking needs a target")]
    MissingTarget(BlockingScope),

    /// The target control could not be found
    #[error("block target '{0}' not found")]
    TargetNotFound(String),

    /// Overlay installation or removal failed
    #[error("overlay error: {0}")]
    Overlay(String),
}

/// Configuration loading and context construction errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected value
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Context built outside a tokio runtime without an explicit handle
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_from_anyhow() {
        let err: TaskError = anyhow::anyhow!("Test Exception").into();
        assert_eq!(err.to_string(), "Test Exception");
        assert!(!err.is_interrupted());
        assert!(TaskError::Interrupted.is_interrupted());
    }

    #[test]
    fn test_usage_error_message_names_task() {
        let task = TaskId::new();
        let err = UsageError::AlreadyExecuted { task, state: TaskState::Started };
        assert!(err.to_string().contains(&task.to_string()));
        assert!(err.to_string().contains("started"));
    }
}
