//! Pluggable synchronization primitives.
//!
//! Task queues never construct locks or events directly. They ask a
//! [`PrimFactory`] for them, so the same queue code runs on top of
//!
//! - [`ThreadPrimFactory`]: real blocking primitives built on
//!   `std::sync::{Mutex, Condvar}` for a pool of worker threads, or
//! - [`SingleThreadPrimFactory`]: diagnostic primitives for a single thread,
//!   where any wait that could only be satisfied by another thread is reported
//!   as [`TaskError::Deadlock`] instead of hanging.
//!
//! Every blocking operation takes a timeout so callers can detect stalls.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Result, TaskError};

/// A mutual-exclusion primitive guarding a critical section.
pub trait Lock: Send + Sync {
    /// Acquire the lock, waiting at most `timeout`.
    fn acquire(&self, timeout: Duration) -> Result<()>;

    /// Release a lock previously acquired by this thread.
    fn release(&self);

    /// Whether the lock is currently held.
    fn is_locked(&self) -> bool;
}

/// A manual-reset event.
pub trait Event: Send + Sync {
    /// Signal the event, waking every waiter.
    fn set(&self);

    /// Clear the event.
    fn unset(&self);

    /// Whether the event is currently signaled.
    fn is_set(&self) -> bool;

    /// Block until the event is signaled, waiting at most `timeout`.
    fn wait(&self, timeout: Duration) -> Result<()>;
}

/// Source of locks and events for task queues and workers.
pub trait PrimFactory: Send + Sync + fmt::Debug {
    /// Create an unlocked lock.
    fn new_lock(&self) -> Box<dyn Lock>;

    /// Create an event in the given initial state.
    fn new_event(&self, initially_set: bool) -> Box<dyn Event>;

    /// Whether primitives from this factory may be shared by several threads.
    fn is_multithreaded(&self) -> bool;
}

/// RAII guard releasing a [`Lock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a dyn Lock,
}

impl<'a> LockGuard<'a> {
    /// Acquire `lock` within `timeout` and return a guard for it.
    pub fn acquire(lock: &'a dyn Lock, timeout: Duration) -> Result<Self> {
        lock.acquire(timeout)?;
        Ok(Self { lock })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The flag is a plain bool; a panicking holder cannot leave it half-written.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Multi-thread backend
// ============================================================================

/// Factory for blocking primitives shared between threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPrimFactory;

impl PrimFactory for ThreadPrimFactory {
    fn new_lock(&self) -> Box<dyn Lock> {
        Box::new(ThreadLock::default())
    }

    fn new_event(&self, initially_set: bool) -> Box<dyn Event> {
        Box::new(ThreadEvent::new(initially_set))
    }

    fn is_multithreaded(&self) -> bool {
        true
    }
}

/// Blocking lock built from a flag and a condition variable.
///
/// Unlike `std::sync::Mutex` it is not tied to a guard's lifetime, which lets
/// it sit behind the object-safe [`Lock`] trait.
#[derive(Debug, Default)]
pub struct ThreadLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl Lock for ThreadLock {
    fn acquire(&self, timeout: Duration) -> Result<()> {
        let guard = relock(&self.locked);
        let (mut locked, wait) = self
            .released
            .wait_timeout_while(guard, timeout, |locked| *locked)
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && *locked {
            return Err(TaskError::Timeout(timeout));
        }
        *locked = true;
        Ok(())
    }

    fn release(&self) {
        *relock(&self.locked) = false;
        self.released.notify_one();
    }

    fn is_locked(&self) -> bool {
        *relock(&self.locked)
    }
}

/// Blocking manual-reset event.
#[derive(Debug, Default)]
pub struct ThreadEvent {
    signaled: Mutex<bool>,
    changed: Condvar,
}

impl ThreadEvent {
    /// Create an event in the given state.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_set),
            changed: Condvar::new(),
        }
    }
}

impl Event for ThreadEvent {
    fn set(&self) {
        *relock(&self.signaled) = true;
        self.changed.notify_all();
    }

    fn unset(&self) {
        *relock(&self.signaled) = false;
    }

    fn is_set(&self) -> bool {
        *relock(&self.signaled)
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let guard = relock(&self.signaled);
        let (signaled, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);
        if *signaled {
            Ok(())
        } else {
            Err(TaskError::Timeout(timeout))
        }
    }
}

// ============================================================================
// Single-thread diagnostic backend
// ============================================================================

/// Factory for non-blocking diagnostic primitives.
///
/// With a single thread nobody else can ever release a lock or signal an
/// event, so waiting would hang forever. These primitives fail fast with
/// [`TaskError::Deadlock`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleThreadPrimFactory;

impl PrimFactory for SingleThreadPrimFactory {
    fn new_lock(&self) -> Box<dyn Lock> {
        Box::new(SingleThreadLock::default())
    }

    fn new_event(&self, initially_set: bool) -> Box<dyn Event> {
        Box::new(SingleThreadEvent::new(initially_set))
    }

    fn is_multithreaded(&self) -> bool {
        false
    }
}

/// Lock that reports re-acquisition as a deadlock.
#[derive(Debug, Default)]
pub struct SingleThreadLock {
    locked: AtomicBool,
}

impl Lock for SingleThreadLock {
    fn acquire(&self, _timeout: Duration) -> Result<()> {
        if self.locked.swap(true, Ordering::AcqRel) {
            return Err(TaskError::deadlock(
                "lock acquired again while already held on the only thread",
            ));
        }
        Ok(())
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// Event that reports waiting on an unset state as a deadlock.
#[derive(Debug, Default)]
pub struct SingleThreadEvent {
    signaled: AtomicBool,
}

impl SingleThreadEvent {
    /// Create an event in the given state.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            signaled: AtomicBool::new(initially_set),
        }
    }
}

impl Event for SingleThreadEvent {
    fn set(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    fn unset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn wait(&self, _timeout: Duration) -> Result<()> {
        if self.is_set() {
            Ok(())
        } else {
            Err(TaskError::deadlock(
                "waiting on an unset event with no other thread to signal it",
            ))
        }
    }
}
