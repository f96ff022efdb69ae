//! Task lifecycle states and blocking scopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task.
///
/// ```text
/// Pending → Started → {Succeeded | Failed | Cancelled | Interrupted} → Finished
/// ```
///
/// A task cancelled before it ever ran skips `Started` and goes straight to
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Constructed, not yet running
    Pending,
    /// The background work is running on a worker
    Started,
    /// The work returned a value
    Succeeded,
    /// The work returned an error or panicked
    Failed,
    /// Cancellation was requested
    Cancelled,
    /// The work stopped at an interruption point
    Interrupted,
    /// All completion callbacks have run
    Finished,
}

impl TaskState {
    /// One of the four outcome states.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::Interrupted
        )
    }

    /// Outcome or finished.
    pub fn is_terminal(self) -> bool {
        self.is_outcome() || self == TaskState::Finished
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Started) => true,
            (TaskState::Pending, TaskState::Cancelled) => true,
            (TaskState::Started, s) if s.is_outcome() => true,
            (s, TaskState::Finished) if s.is_outcome() => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Started => write!(f, "started"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::Interrupted => write!(f, "interrupted"),
            TaskState::Finished => write!(f, "finished"),
        }
    }
}

/// How much of the UI is blocked while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingScope {
    /// Nothing is blocked
    #[default]
    None,
    /// Only the originating control is disabled
    Action,
    /// The nearest enclosing container is disabled
    Component,
    /// The window containing the originating control is overlaid
    Window,
    /// Every open window is overlaid
    Application,
}

impl fmt::Display for BlockingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockingScope::None => write!(f, "none"),
            BlockingScope::Action => write!(f, "action"),
            BlockingScope::Component => write!(f, "component"),
            BlockingScope::Window => write!(f, "window"),
            BlockingScope::Application => write!(f, "application"),
        }
    }
}
