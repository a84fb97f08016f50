//! Worker threads draining task executors.
//!
//! A [`WorkerThread`] loops until stopped, visiting every attached
//! [`TaskExecutor`] in turn: it waits briefly for work, executes the next
//! available task, and moves on. Several executors can share one thread, so a
//! small pool can service more task sources than it has threads.
//!
//! A failing task aborts the executor it came from and ends the thread with
//! [`WorkerExit::TaskFailed`]; a deadlock reported by the diagnostic
//! primitives ends it with [`WorkerExit::Deadlock`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Result, TaskError};
use crate::queue::TaskExecutor;

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerExit {
    /// [`WorkerThread::stop`] was called.
    Stopped,
    /// A task failed; its executor was aborted.
    TaskFailed,
    /// The primitive backend detected a wait that can never finish.
    Deadlock,
}

impl WorkerExit {
    /// Process-style exit code for this outcome.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::TaskFailed => 1,
            Self::Deadlock => 2,
        }
    }
}

/// Configuration for a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Thread name, also used in logs.
    pub name: String,
    /// How long to wait on each executor before moving to the next one.
    pub wait_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "sim-worker".to_string(),
            wait_timeout: Duration::from_millis(10),
        }
    }
}

impl WorkerConfig {
    /// Default configuration with the given thread name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A thread that executes tasks from one or more executors.
pub struct WorkerThread {
    config: WorkerConfig,
    executors: Mutex<Vec<Arc<dyn TaskExecutor>>>,
    stopped: AtomicBool,
}

impl WorkerThread {
    /// Create a worker with no executors attached.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            executors: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Attach another executor. Safe to call while the worker is running.
    pub fn add_executor(&self, executor: Arc<dyn TaskExecutor>) {
        debug!(worker = %self.config.name, executor = executor.name(), "executor attached");
        self.executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(executor);
    }

    /// Number of attached executors.
    #[must_use]
    pub fn executor_count(&self) -> usize {
        self.executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ask the loop to finish after its current pass.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether [`stop`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run [`run`](Self::run) on a new OS thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<WorkerExit>> {
        let worker = Arc::clone(self);
        thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || worker.run())
    }

    /// Run the worker loop on the current thread until stopped or failed.
    pub fn run(&self) -> WorkerExit {
        info!(worker = %self.config.name, "worker started");
        let exit = loop {
            if self.is_stopped() {
                break WorkerExit::Stopped;
            }
            if let Some(exit) = self.run_pass() {
                break exit;
            }
        };
        match exit {
            WorkerExit::Stopped => info!(worker = %self.config.name, "worker stopped"),
            _ => error!(worker = %self.config.name, code = exit.code(), "worker terminated"),
        }
        exit
    }

    /// Visit every executor once. Returns the exit reason if the loop must end.
    fn run_pass(&self) -> Option<WorkerExit> {
        let executors: Vec<_> = self
            .executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut waited = false;
        for executor in &executors {
            if self.is_stopped() {
                return None;
            }
            match executor.wait_for_tasks(self.config.wait_timeout) {
                Ok(true) => {
                    waited = true;
                    if let Some(exit) = self.execute_next(executor.as_ref()) {
                        return Some(exit);
                    }
                }
                Ok(false) => waited = true,
                Err(TaskError::Aborted) => {}
                Err(err) if err.is_deadlock() => {
                    error!(
                        worker = %self.config.name,
                        executor = executor.name(),
                        %err,
                        "deadlock while waiting for tasks"
                    );
                    return Some(WorkerExit::Deadlock);
                }
                Err(err) => {
                    warn!(
                        worker = %self.config.name,
                        executor = executor.name(),
                        %err,
                        "wait for tasks failed"
                    );
                }
            }
        }

        if !waited {
            // Nothing attached, or every executor is aborted.
            thread::sleep(self.config.wait_timeout);
        }
        None
    }

    fn execute_next(&self, executor: &dyn TaskExecutor) -> Option<WorkerExit> {
        match executor.pop() {
            Ok(Some(lease)) => {
                if let Err(err) = lease.execute() {
                    error!(
                        worker = %self.config.name,
                        executor = executor.name(),
                        %err,
                        "task failed, aborting executor"
                    );
                    executor.abort();
                    return Some(WorkerExit::TaskFailed);
                }
                None
            }
            Ok(None) | Err(TaskError::Aborted) => None,
            Err(err) if err.is_deadlock() => {
                error!(
                    worker = %self.config.name,
                    executor = executor.name(),
                    %err,
                    "deadlock while popping"
                );
                Some(WorkerExit::Deadlock)
            }
            Err(err) => {
                warn!(
                    worker = %self.config.name,
                    executor = executor.name(),
                    %err,
                    "pop failed"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("config", &self.config)
            .field("executors", &self.executor_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Execute every queued task of `executor` on the calling thread.
///
/// This is the single-thread schedule: no worker thread is involved and no
/// wait is ever issued. Returns the number of tasks executed.
///
/// # Errors
///
/// The first task failure aborts the executor and is returned.
pub fn drain(executor: &dyn TaskExecutor) -> Result<usize> {
    let mut executed = 0;
    while let Some(lease) = executor.pop()? {
        if let Err(err) = lease.execute() {
            executor.abort();
            return Err(err);
        }
        executed += 1;
    }
    Ok(executed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::prim::{SingleThreadPrimFactory, ThreadPrimFactory};
    use crate::queue::TaskQueue;
    use crate::task::{Task, TaskState};

    fn counting_queue(
        factory: &dyn crate::prim::PrimFactory,
        count: usize,
        counter: &Arc<AtomicUsize>,
    ) -> Arc<TaskQueue> {
        let queue = Arc::new(TaskQueue::new("counting", count, factory));
        for i in 0..count {
            let counter = Arc::clone(counter);
            queue
                .push(Arc::new(Task::from_fn(format!("t{i}"), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })))
                .unwrap();
        }
        queue
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            WorkerExit::Stopped.code(),
            WorkerExit::TaskFailed.code(),
            WorkerExit::Deadlock.code(),
        ];
        assert_eq!(codes, [0, 1, 2]);
    }

    #[test]
    fn test_drain_runs_everything() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = counting_queue(&SingleThreadPrimFactory, 5, &counter);
        assert_eq!(drain(queue.as_ref()).unwrap(), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(queue.is_emptied());
    }

    #[test]
    fn test_drain_aborts_on_failure() {
        let queue = TaskQueue::new("q", 3, &SingleThreadPrimFactory);
        queue
            .push(Arc::new(Task::from_fn("ok", || Ok(()))))
            .unwrap();
        queue
            .push(Arc::new(Task::from_fn("bad", || Err("boom".to_string()))))
            .unwrap();
        queue
            .push(Arc::new(Task::from_fn("never", || Ok(()))))
            .unwrap();

        let err = drain(&queue).unwrap_err();
        assert_eq!(err, TaskError::task_failed("bad", "boom"));
        assert!(queue.is_aborted());
        assert_eq!(queue.tasks()[2].state(), TaskState::Aborted);
    }

    #[test]
    fn test_worker_drains_queue_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = counting_queue(&ThreadPrimFactory, 16, &counter);

        let worker = Arc::new(WorkerThread::new(WorkerConfig::named("test-worker")));
        worker.add_executor(queue.clone());
        let handle = worker.spawn().unwrap();

        queue.wait_till_emptied(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);

        worker.stop();
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
    }

    #[test]
    fn test_worker_task_failure_exit() {
        let queue = Arc::new(TaskQueue::new("q", 2, &ThreadPrimFactory));
        queue
            .push(Arc::new(Task::from_fn("bad", || Err("boom".to_string()))))
            .unwrap();
        queue
            .push(Arc::new(Task::from_fn("later", || Ok(()))))
            .unwrap();

        let worker = Arc::new(WorkerThread::new(WorkerConfig::named("failing")));
        worker.add_executor(queue.clone());
        let handle = worker.spawn().unwrap();

        assert_eq!(handle.join().unwrap(), WorkerExit::TaskFailed);
        assert!(queue.is_aborted());
        assert_eq!(
            queue.wait_till_emptied(Duration::from_secs(1)),
            Err(TaskError::Aborted)
        );
    }

    #[test]
    fn test_worker_single_thread_backend_reports_deadlock() {
        let queue = Arc::new(TaskQueue::new("idle", 1, &SingleThreadPrimFactory));
        let worker = WorkerThread::new(WorkerConfig::named("diagnostic"));
        worker.add_executor(queue);
        assert_eq!(worker.run(), WorkerExit::Deadlock);
    }

    #[test]
    fn test_one_worker_many_executors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = counting_queue(&ThreadPrimFactory, 4, &counter);
        let b = counting_queue(&ThreadPrimFactory, 6, &counter);

        let worker = Arc::new(WorkerThread::new(WorkerConfig::named("shared")));
        worker.add_executor(a.clone());
        worker.add_executor(b.clone());
        assert_eq!(worker.executor_count(), 2);
        let handle = worker.spawn().unwrap();

        a.wait_till_emptied(Duration::from_secs(5)).unwrap();
        b.wait_till_emptied(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        worker.stop();
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
    }
}
