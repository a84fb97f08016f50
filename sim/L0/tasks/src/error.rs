//! Error types for the task substrate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while scheduling or executing tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// A push was attempted on a queue that is already at capacity.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull {
        /// Capacity of the rejected queue.
        capacity: usize,
    },

    /// An operation that requires an empty queue found pending tasks.
    #[error("task queue is not empty ({pending} task(s) pending)")]
    QueueNotEmpty {
        /// Number of tasks that have not been popped yet.
        pending: usize,
    },

    /// A task was driven through an illegal state transition.
    #[error("invalid task state transition: {0}")]
    InvalidState(String),

    /// A bounded wait expired.
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    /// A wait can never be satisfied (single-thread backend waiting on an unset event,
    /// or re-entrant locking).
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// The executor was aborted and no longer hands out work.
    #[error("executor aborted")]
    Aborted,

    /// A task body reported a failure.
    #[error("task '{task}' failed: {reason}")]
    TaskFailed {
        /// Name of the failing task.
        task: String,
        /// Failure description from the task body.
        reason: String,
    },
}

impl TaskError {
    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a deadlock error.
    pub fn deadlock(msg: impl Into<String>) -> Self {
        Self::Deadlock(msg.into())
    }

    /// Create a task failure error.
    pub fn task_failed(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a detected deadlock.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock(_))
    }

    /// Check if this error is an expired bounded wait.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, TaskError>;
