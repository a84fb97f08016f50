//! Bounded FIFO of reusable tasks.
//!
//! A [`TaskQueue`] is a fixed-capacity array of tasks plus a pop cursor:
//!
//! ```text
//!   tasks:  [ t0 | t1 | t2 | t3 | t4 |  -  |  -  ]   capacity = 7
//!                       ▲                ▲
//!                     first          len (= last + 1)
//! ```
//!
//! `first ≤ len` always holds; the queue is empty when `first == len` and full
//! when `len == capacity`. Its lifetime is one simulation step: the driver
//! pushes (or [`reset`](TaskQueue::reset)s) once, workers pop to exhaustion,
//! and the driver blocks on [`wait_till_emptied`](TaskQueue::wait_till_emptied)
//! before starting the next dependent phase.
//!
//! The "emptied" event is raised once the queue is empty *and* every popped
//! task has been handed back (its [`TaskLease`] dropped), so the barrier
//! covers task completion and not merely task hand-out.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{Result, TaskError};
use crate::prim::{Event, Lock, LockGuard, PrimFactory};
use crate::task::Task;

/// Default bound on how long queue operations wait for the queue lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// A source of tasks that worker threads drain.
pub trait TaskExecutor: Send + Sync {
    /// Executor name used in logs.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for work to become available.
    ///
    /// Returns `Ok(false)` if the wait expired without work.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Aborted`] once the executor has been aborted.
    /// - [`TaskError::Deadlock`] if the wait can never be satisfied.
    fn wait_for_tasks(&self, timeout: Duration) -> Result<bool>;

    /// Take the next task, or `None` if nothing is queued. Never blocks on an
    /// empty queue.
    ///
    /// # Errors
    ///
    /// Fails if the queue lock cannot be acquired or the executor was aborted.
    fn pop(&self) -> Result<Option<TaskLease<'_>>>;

    /// Hand a popped task back. Called by [`TaskLease`] on drop.
    fn finish(&self, task: &Task);

    /// Cancel all outstanding work and release any waiter.
    fn abort(&self);

    /// Whether [`abort`](Self::abort) has been called since the last reset.
    fn is_aborted(&self) -> bool;
}

/// A task checked out of an executor.
///
/// Dereferences to the [`Task`]; dropping the lease reports the task as
/// finished to its executor.
pub struct TaskLease<'a> {
    task: Arc<Task>,
    executor: &'a dyn TaskExecutor,
}

impl<'a> TaskLease<'a> {
    /// Lease `task` from `executor`.
    pub fn new(task: Arc<Task>, executor: &'a dyn TaskExecutor) -> Self {
        Self { task, executor }
    }

    /// Shared handle to the leased task.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

impl Deref for TaskLease<'_> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl Drop for TaskLease<'_> {
    fn drop(&mut self) {
        self.executor.finish(&self.task);
    }
}

impl fmt::Debug for TaskLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLease")
            .field("task", &self.task)
            .field("executor", &self.executor.name())
            .finish()
    }
}

/// Fixed-capacity FIFO of reusable tasks.
pub struct TaskQueue {
    name: String,
    capacity: usize,
    tasks: RwLock<Vec<Arc<Task>>>,
    first: AtomicUsize,
    in_flight: AtomicUsize,
    aborted: AtomicBool,
    lock: Box<dyn Lock>,
    emptied: Box<dyn Event>,
    has_tasks: Box<dyn Event>,
    lock_timeout: Duration,
}

impl TaskQueue {
    /// Create an empty queue holding at most `capacity` tasks.
    ///
    /// The "emptied" event starts signaled.
    pub fn new(name: impl Into<String>, capacity: usize, factory: &dyn PrimFactory) -> Self {
        let name = name.into();
        debug!(queue = %name, capacity, "creating task queue");
        Self {
            name,
            capacity,
            tasks: RwLock::new(Vec::with_capacity(capacity)),
            first: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            lock: factory.new_lock(),
            emptied: factory.new_event(true),
            has_tasks: factory.new_event(false),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how long operations wait for the queue lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Maximum number of tasks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn pushed(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of tasks pushed since the last [`clear`](Self::clear).
    #[must_use]
    pub fn len(&self) -> usize {
        self.pushed()
    }

    /// Number of tasks not yet popped.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pushed()
            .saturating_sub(self.first.load(Ordering::Acquire))
    }

    /// Whether every pushed task has been popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Whether no more tasks can be pushed.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pushed() == self.capacity
    }

    /// Whether the "emptied" event is currently signaled.
    #[must_use]
    pub fn is_emptied(&self) -> bool {
        self.emptied.is_set()
    }

    /// Append a task.
    ///
    /// The first push after the queue drained clears the "emptied" signal.
    ///
    /// # Errors
    ///
    /// - [`TaskError::QueueFull`] at capacity; the queue is left untouched.
    /// - Lock acquisition failures.
    pub fn push(&self, task: Arc<Task>) -> Result<()> {
        let _guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout)?;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.len() >= self.capacity {
            error!(queue = %self.name, capacity = self.capacity, "push on full task queue");
            return Err(TaskError::QueueFull {
                capacity: self.capacity,
            });
        }
        tasks.push(task);
        self.emptied.unset();
        self.has_tasks.set();
        Ok(())
    }

    /// Rewind the queue so every pushed task runs again.
    ///
    /// All tasks are returned to the pending state. Clears the abort flag.
    ///
    /// # Errors
    ///
    /// [`TaskError::QueueNotEmpty`] if tasks are still queued or in flight.
    pub fn reset(&self) -> Result<()> {
        let _guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout)?;
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let first = self.first.load(Ordering::Acquire);
        let pending = tasks.len().saturating_sub(first) + self.in_flight.load(Ordering::Acquire);
        if pending > 0 {
            error!(queue = %self.name, pending, "reset of non-empty task queue");
            return Err(TaskError::QueueNotEmpty { pending });
        }
        for task in tasks.iter() {
            task.reset()?;
        }
        self.first.store(0, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        if !tasks.is_empty() {
            self.emptied.unset();
            self.has_tasks.set();
        }
        Ok(())
    }

    /// Remove every task so a new set can be pushed.
    ///
    /// # Errors
    ///
    /// [`TaskError::QueueNotEmpty`] if tasks are still queued or in flight.
    pub fn clear(&self) -> Result<()> {
        let _guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout)?;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let first = self.first.load(Ordering::Acquire);
        let pending = tasks.len().saturating_sub(first) + self.in_flight.load(Ordering::Acquire);
        if pending > 0 {
            return Err(TaskError::QueueNotEmpty { pending });
        }
        tasks.clear();
        self.first.store(0, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        self.has_tasks.unset();
        self.emptied.set();
        Ok(())
    }

    /// Block until the queue is empty and every popped task has finished.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Timeout`] if the barrier is not reached in time.
    /// - [`TaskError::Deadlock`] on the single-thread backend when work remains.
    /// - [`TaskError::Aborted`] if the queue was aborted.
    pub fn wait_till_emptied(&self, timeout: Duration) -> Result<()> {
        self.emptied.wait(timeout)?;
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }
        Ok(())
    }

    /// Snapshot of the pushed tasks.
    #[must_use]
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TaskExecutor for TaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait_for_tasks(&self, timeout: Duration) -> Result<bool> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }
        match self.has_tasks.wait(timeout) {
            Ok(()) => {
                if self.is_aborted() {
                    Err(TaskError::Aborted)
                } else {
                    Ok(true)
                }
            }
            Err(TaskError::Timeout(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn pop(&self) -> Result<Option<TaskLease<'_>>> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }
        let _guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout)?;
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let index = self.first.load(Ordering::Acquire);
        let Some(task) = tasks.get(index) else {
            return Ok(None);
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.first.store(index + 1, Ordering::Release);
        if index + 1 == tasks.len() {
            self.has_tasks.unset();
        }
        Ok(Some(TaskLease::new(Arc::clone(task), self)))
    }

    fn finish(&self, task: &Task) {
        let guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout);
        if let Err(err) = &guard {
            warn!(
                queue = %self.name,
                task = task.name(),
                %err,
                "finishing task without queue lock"
            );
        }
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.is_empty() {
            self.emptied.set();
        }
        drop(guard);
    }

    fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        let guard = LockGuard::acquire(self.lock.as_ref(), self.lock_timeout);
        if let Err(err) = &guard {
            warn!(queue = %self.name, %err, "aborting task queue without queue lock");
        }
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let first = self.first.swap(tasks.len(), Ordering::AcqRel);
        let cancelled = tasks.iter().skip(first).filter(|t| t.abort()).count();
        warn!(queue = %self.name, cancelled, "task queue aborted");
        // Wake both the driver and any idle worker so they observe the abort.
        drop(tasks);
        drop(guard);
        self.emptied.set();
        self.has_tasks.set();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("first", &self.first.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
