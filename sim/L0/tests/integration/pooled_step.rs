//! Worker pool stepping.
//!
//! The pooled schedule (`prepare_tasks` → workers → `wait_for_tasks` →
//! `compute_next_step`) must produce exactly what the inline schedule does:
//! corrections are folded in cluster order on the driver thread, so thread
//! timing cannot change the result.

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};
use sim_deformable::{DeformableError, Force, Model, ModelConfig, Region};
use sim_tasks::{
    SingleThreadPrimFactory, TaskError, TaskExecutor, ThreadPrimFactory, WorkerExit, drain,
};

use crate::common::{DT, WorkerPool, lattice_model};

const WAIT: Duration = Duration::from_secs(10);

fn scene_forces() -> Vec<Force> {
    vec![
        Force::uniform(Vector3::new(0.0, 0.0, -9.81)),
        Force::half_space_spring(500.0, 5.0, Point3::new(0.0, 0.0, -0.2), Vector3::z()),
    ]
}

fn kick(model: &mut Model) {
    model.hit(
        &Region::sphere(Point3::new(3.0, 3.0, 3.0), 0.5),
        &Vector3::new(2.0, -1.0, 0.5),
    );
}

fn pooled_step(model: &mut Model, forces: &[Force]) {
    model.prepare_tasks(DT).unwrap();
    model.wait_for_tasks(WAIT).unwrap();
    model.compute_next_step(forces, DT).unwrap();
}

#[test]
fn pooled_matches_inline() {
    let config = ModelConfig::default().with_grid([2, 2, 2], 0.25);
    let forces = scene_forces();

    let mut inline = lattice_model(4, config, Arc::new(SingleThreadPrimFactory));
    let mut pooled = lattice_model(4, config, Arc::new(ThreadPrimFactory));
    kick(&mut inline);
    kick(&mut pooled);

    // The first prepare builds the queue the workers attach to.
    let queue = pooled.prepare_tasks(DT).unwrap();
    let pool = WorkerPool::spawn(4, &[queue as Arc<dyn TaskExecutor>]);
    pooled.wait_for_tasks(WAIT).unwrap();
    pooled.compute_next_step(&forces, DT).unwrap();
    inline.step(&forces, DT).unwrap();

    for _ in 1..50 {
        pooled_step(&mut pooled, &forces);
        inline.step(&forces, DT).unwrap();
    }
    let exits = pool.shutdown();
    assert!(exits.iter().all(|&exit| exit == WorkerExit::Stopped));

    assert_eq!(pooled.step_count(), 50);
    for (a, b) in pooled.vertices().iter().zip(inline.vertices()) {
        assert_relative_eq!(a.position, b.position, epsilon = 1e-12);
        assert_relative_eq!(a.velocity, b.velocity, epsilon = 1e-12);
    }
}

#[test]
fn one_pool_serves_several_models() {
    let gravity = [Force::uniform(Vector3::new(0.0, 0.0, -9.81))];
    let mut models: Vec<Model> = (0..3)
        .map(|_| {
            lattice_model(3, ModelConfig::default(), Arc::new(ThreadPrimFactory))
        })
        .collect();
    let executors: Vec<Arc<dyn TaskExecutor>> = models
        .iter_mut()
        .map(|m| m.prepare_tasks(DT).unwrap() as Arc<dyn TaskExecutor>)
        .collect();

    let pool = WorkerPool::spawn(2, &executors);
    for model in &mut models {
        model.wait_for_tasks(WAIT).unwrap();
        model.compute_next_step(&gravity, DT).unwrap();
    }
    for _ in 0..10 {
        for model in &mut models {
            pooled_step(model, &gravity);
        }
    }
    pool.shutdown();

    for model in &models {
        assert_eq!(model.step_count(), 11);
        assert!(model.vertex(0).unwrap().position.z < 0.0);
    }
}

#[test]
fn barrier_without_workers_times_out() {
    let mut model = lattice_model(3, ModelConfig::default(), Arc::new(ThreadPrimFactory));
    model.prepare_tasks(DT).unwrap();

    let err = model.wait_for_tasks(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, DeformableError::Task(TaskError::Timeout(_))));
    assert!(matches!(
        model.compute_next_step(&[], DT),
        Err(DeformableError::Task(TaskError::QueueNotEmpty { .. }))
    ));
}

#[test]
fn single_thread_barrier_reports_deadlock() {
    let mut model = lattice_model(3, ModelConfig::default(), Arc::new(SingleThreadPrimFactory));
    let queue = model.prepare_tasks(DT).unwrap();

    let err = model.wait_for_tasks(WAIT).unwrap_err();
    assert!(matches!(&err, DeformableError::Task(e) if e.is_deadlock()));

    // Draining on the driver thread satisfies the barrier.
    assert_eq!(drain(queue.as_ref()).unwrap(), model.cluster_count());
    model.wait_for_tasks(WAIT).unwrap();
    model.compute_next_step(&[], DT).unwrap();
}

#[test]
fn aborted_step_is_refused_then_recovers() {
    let mut model = lattice_model(3, ModelConfig::default(), Arc::new(ThreadPrimFactory));
    let queue = model.prepare_tasks(DT).unwrap();
    queue.abort();

    assert!(matches!(
        model.wait_for_tasks(WAIT),
        Err(DeformableError::Task(TaskError::Aborted))
    ));
    assert!(matches!(
        model.compute_next_step(&[], DT),
        Err(DeformableError::Task(TaskError::Aborted))
    ));
    assert_eq!(model.step_count(), 0);

    // Re-arming clears the abort.
    model.step(&[], DT).unwrap();
    assert_eq!(model.step_count(), 1);
}
