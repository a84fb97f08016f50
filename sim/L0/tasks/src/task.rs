//! Units of work and their lifecycle.
//!
//! A [`Task`] wraps a [`Job`] with an atomic state machine:
//!
//! ```text
//! Pending ──execute()──▶ Executing ──▶ Complete
//!    ▲                                   │
//!    └──────────────reset()──────────────┘
//!
//! any non-complete state ──abort()──▶ Aborted
//! ```
//!
//! Tasks are reusable: after completion, [`Task::reset`] re-arms them without
//! reallocating, so a fixed set of tasks can be replayed every simulation step.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, TaskError};

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting to be executed.
    Pending = 0,
    /// Currently running on some thread.
    Executing = 1,
    /// Finished; may be reset for reuse.
    Complete = 2,
    /// Cancelled by an executor abort; unusable until reset.
    Aborted = 3,
}

impl TaskState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Executing,
            2 => Self::Complete,
            _ => Self::Aborted,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The body of a task.
///
/// Jobs run through a shared reference because several threads may hold the
/// owning [`Task`]; any state they mutate must carry its own synchronization.
pub trait Job: Send + Sync {
    /// Run the job once.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure. The executing worker aborts the
    /// executor the task came from.
    fn run(&self) -> std::result::Result<(), String>;
}

impl<F> Job for F
where
    F: Fn() -> std::result::Result<(), String> + Send + Sync,
{
    fn run(&self) -> std::result::Result<(), String> {
        self()
    }
}

/// A named, reusable unit of work.
pub struct Task {
    name: String,
    state: AtomicU8,
    job: Box<dyn Job>,
}

impl Task {
    /// Create a pending task.
    pub fn new(name: impl Into<String>, job: impl Job + 'static) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(TaskState::Pending as u8),
            job: Box::new(job),
        }
    }

    /// Create a pending task from a closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self::new(name, f)
    }

    /// Task name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether the task has finished executing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state() == TaskState::Complete
    }

    fn transition(&self, from: TaskState, to: TaskState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                TaskError::invalid_state(format!(
                    "task '{}' cannot go {from} -> {to}: it is {}",
                    self.name, TaskState::from_raw(actual)
                ))
            })
    }

    /// Execute the task: `Pending → Executing → Complete`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidState`] if the task is not pending.
    /// - [`TaskError::TaskFailed`] if the job reports a failure. The task is
    ///   left [`TaskState::Aborted`].
    pub fn execute(&self) -> Result<()> {
        self.transition(TaskState::Pending, TaskState::Executing)?;
        match self.job.run() {
            Ok(()) => {
                self.state
                    .store(TaskState::Complete as u8, Ordering::Release);
                Ok(())
            }
            Err(reason) => {
                self.state
                    .store(TaskState::Aborted as u8, Ordering::Release);
                Err(TaskError::task_failed(&self.name, reason))
            }
        }
    }

    /// Re-arm a finished or aborted task: `Complete | Aborted → Pending`.
    ///
    /// Resetting an already pending task is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidState`] while the task is executing.
    pub fn reset(&self) -> Result<()> {
        match self.state() {
            TaskState::Pending => Ok(()),
            TaskState::Executing => Err(TaskError::invalid_state(format!(
                "task '{}' cannot be reset while executing",
                self.name
            ))),
            TaskState::Complete => self.transition(TaskState::Complete, TaskState::Pending),
            TaskState::Aborted => self.transition(TaskState::Aborted, TaskState::Pending),
        }
    }

    /// Mark a task that has not finished as unusable.
    ///
    /// Returns `true` if the state changed.
    pub fn abort(&self) -> bool {
        self.transition(TaskState::Pending, TaskState::Aborted)
            .is_ok()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
