//! Task lifecycle events.

use crate::error::TaskError;
use crate::id::TaskId;
use crate::state::TaskState;
use std::sync::Arc;

/// A state change published by a task on the dispatch context.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// Task that emitted the event
    pub task_id: TaskId,

    /// Task state when the event was emitted
    pub state: TaskState,

    /// What happened
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    /// Create a new event.
    pub fn new(task_id: TaskId, state: TaskState, payload: TaskEventPayload) -> Self {
        Self { task_id, state, payload }
    }

    /// Short name of the payload, stable across releases.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Payload of a [`TaskEvent`].
///
/// Per task the order is fixed:
/// `Started`, `DoInBackground`, any number of `Message`/`Progress`,
/// one outcome, `Finished`, `Done`, `Completed`.
#[derive(Debug, Clone)]
pub enum TaskEventPayload {
    /// Pending → Started
    Started,
    /// The background work is about to run
    DoInBackground,
    /// The status message changed
    Message {
        /// Previous message
        old: Option<String>,
        /// Current message
        new: Option<String>,
    },
    /// Progress changed; `None` means indeterminate
    Progress {
        /// Previous progress
        old: Option<u8>,
        /// Current progress
        new: Option<u8>,
    },
    /// The work returned a value
    Succeeded,
    /// The work failed
    Failed(Arc<TaskError>),
    /// The task was cancelled
    Cancelled,
    /// The work was interrupted
    Interrupted,
    /// The finished hook has run
    Finished,
    /// The task reached the Finished state
    Done,
    /// Last event a task ever emits
    Completed,
}

impl TaskEventPayload {
    /// Short name of the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEventPayload::Started => "started",
            TaskEventPayload::DoInBackground => "doInBackground",
            TaskEventPayload::Message { .. } => "message",
            TaskEventPayload::Progress { .. } => "progress",
            TaskEventPayload::Succeeded => "succeeded",
            TaskEventPayload::Failed(_) => "failed",
            TaskEventPayload::Cancelled => "cancelled",
            TaskEventPayload::Interrupted => "interrupted",
            TaskEventPayload::Finished => "finished",
            TaskEventPayload::Done => "done",
            TaskEventPayload::Completed => "completed",
        }
    }

    /// One of the four outcome payloads.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            TaskEventPayload::Succeeded
                | TaskEventPayload::Failed(_)
                | TaskEventPayload::Cancelled
                | TaskEventPayload::Interrupted
        )
    }
}
