//! Worker termination on task failure and deadlock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sim_tasks::{
    SingleThreadPrimFactory, Task, TaskError, TaskExecutor, TaskQueue, TaskState,
    ThreadPrimFactory, WorkerConfig, WorkerExit, WorkerThread,
};

#[test]
fn failing_task_terminates_worker_and_aborts_queue() {
    let queue = Arc::new(TaskQueue::new("faulty", 4, &ThreadPrimFactory));
    let ran = Arc::new(AtomicUsize::new(0));
    let failing = Task::from_fn("fails", || Err("bad input".to_string()));
    queue.push(Arc::new(failing)).unwrap();
    for i in 0..3 {
        let ran = Arc::clone(&ran);
        queue
            .push(Arc::new(Task::from_fn(format!("ok {i}"), move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();
    }

    let worker = Arc::new(WorkerThread::new(WorkerConfig::named("faulty-worker")));
    worker.add_executor(queue.clone());
    let exit = worker.spawn().unwrap().join().unwrap();

    assert_eq!(exit, WorkerExit::TaskFailed);
    assert_eq!(exit.code(), 1);
    assert!(queue.is_aborted());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(matches!(
        queue.wait_till_emptied(Duration::from_millis(100)),
        Err(TaskError::Aborted)
    ));
    assert!(
        queue
            .tasks()
            .iter()
            .all(|t| t.state() == TaskState::Aborted)
    );

    queue.reset().unwrap();
    assert!(!queue.is_aborted());
    assert_eq!(queue.pending(), 4);
}

#[test]
fn single_thread_wait_ends_worker_with_deadlock() {
    let queue = Arc::new(TaskQueue::new("idle", 1, &SingleThreadPrimFactory));
    let worker = WorkerThread::new(WorkerConfig::named("diagnostic"));
    worker.add_executor(queue);

    let exit = worker.run();
    assert_eq!(exit, WorkerExit::Deadlock);
    assert_eq!(exit.code(), 2);
}

#[test]
fn stopped_worker_exits_cleanly() {
    let queue = Arc::new(TaskQueue::new("quiet", 1, &ThreadPrimFactory));
    let worker = Arc::new(WorkerThread::new(WorkerConfig {
        name: "quiet-worker".to_string(),
        wait_timeout: Duration::from_millis(1),
    }));
    worker.add_executor(queue);
    let handle = worker.spawn().unwrap();
    worker.stop();
    assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
}
