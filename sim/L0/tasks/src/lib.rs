//! Task scheduling substrate for per-step simulation work.
//!
//! A simulation step that fans work out to threads and back in needs three
//! things, each provided here:
//!
//! - [`Task`] / [`Job`] - a reusable unit of work with an explicit
//!   `Pending → Executing → Complete` lifecycle
//! - [`TaskQueue`] - a bounded FIFO that workers drain and the driver uses as
//!   a barrier between dependent phases ([`TaskQueue::wait_till_emptied`])
//! - [`WorkerThread`] - a loop that services one or more [`TaskExecutor`]s
//!
//! Locks and events come from a [`PrimFactory`], so the same code runs on a
//! real thread pool ([`ThreadPrimFactory`]) or on one thread with diagnostic
//! primitives ([`SingleThreadPrimFactory`]) that fail fast instead of hanging.
//!
//! # Schedule
//!
//! ```text
//! driver:   push/reset ──▶ wait_till_emptied ─────────────▶ next phase
//!                │                  ▲
//! workers:       └──▶ pop ▶ execute ┴ pop ▶ execute ... (queue empty)
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sim_tasks::{Task, TaskQueue, ThreadPrimFactory, WorkerConfig, WorkerThread};
//!
//! let queue = Arc::new(TaskQueue::new("step", 8, &ThreadPrimFactory));
//! for i in 0..8 {
//!     queue.push(Arc::new(Task::from_fn(format!("job {i}"), || Ok(())))).unwrap();
//! }
//!
//! let worker = Arc::new(WorkerThread::new(WorkerConfig::named("worker-0")));
//! worker.add_executor(queue.clone());
//! let handle = worker.spawn().unwrap();
//!
//! queue.wait_till_emptied(Duration::from_secs(5)).unwrap();
//! worker.stop();
//! handle.join().unwrap();
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod error;
pub mod prim;
pub mod queue;
pub mod task;
pub mod worker;

pub use error::{Result, TaskError};
pub use prim::{
    Event, Lock, LockGuard, PrimFactory, SingleThreadPrimFactory, ThreadPrimFactory,
};
pub use queue::{DEFAULT_LOCK_TIMEOUT, TaskExecutor, TaskLease, TaskQueue};
pub use task::{Job, Task, TaskState};
pub use worker::{WorkerConfig, WorkerExit, WorkerThread, drain};
