//! Reactions observed while a worker pool runs the cluster phase.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nalgebra::{Point3, Vector3};
use sim_deformable::{
    Force, ModelConfig, Region, RegionEvent, RegionReaction, ShapeDeformationEvent,
    ShapeDeformationReaction,
};
use sim_tasks::{TaskExecutor, ThreadPrimFactory};

use crate::common::{DT, WorkerPool, lattice_model};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn falling_body_enters_floor_region_once_per_step() {
    let mut model = lattice_model(3, ModelConfig::default(), Arc::new(ThreadPrimFactory));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let floor = Region::aabb(
        Point3::new(-10.0, -10.0, -10.0),
        Point3::new(10.0, 10.0, -0.05),
    );
    model
        .add_region_reaction(RegionReaction::new(
            floor,
            (0..27).collect(),
            true,
            move |e: &RegionEvent| sink.lock().unwrap().push(*e),
        ))
        .unwrap();

    let gravity = [Force::uniform(Vector3::new(0.0, 0.0, -9.81))];
    let queue = model.prepare_tasks(DT).unwrap();
    let pool = WorkerPool::spawn(2, &[queue as Arc<dyn TaskExecutor>]);

    let mut fired_steps = Vec::new();
    for step in 0..20 {
        if step > 0 {
            model.prepare_tasks(DT).unwrap();
        }
        model.wait_for_tasks(WAIT).unwrap();
        let report = model.compute_next_step(&gravity, DT).unwrap();
        if report.fired_reactions > 0 {
            assert_eq!(report.fired_reactions, 1);
            fired_steps.push(step);
        }
    }
    pool.shutdown();

    // After k steps the body has fallen g·dt²·k(k+1)/2; k = 10 is the first
    // past 5 cm.
    assert_eq!(fired_steps, (9..20).collect::<Vec<_>>());
    let events = events.lock().unwrap();
    assert_eq!(events.len(), fired_steps.len());
    assert!(events.iter().all(|e| e.vertex == 0 && e.position.z < -0.05));
}

#[test]
fn deformation_reaction_reports_worst_vertex() {
    let mut model = lattice_model(3, ModelConfig::default(), Arc::new(ThreadPrimFactory));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    model
        .add_shape_deformation_reaction(ShapeDeformationReaction::new(
            (0..27).collect(),
            0.001,
            move |e: &ShapeDeformationEvent| sink.lock().unwrap().push(*e),
        ))
        .unwrap();

    let hit = model.hit(
        &Region::sphere(Point3::new(2.0, 2.0, 2.0), 0.1),
        &Vector3::new(1.0, 1.0, 1.0),
    );
    assert_eq!(hit.hit_vertices, vec![26]);

    let queue = model.prepare_tasks(DT).unwrap();
    let pool = WorkerPool::spawn(2, &[queue as Arc<dyn TaskExecutor>]);
    model.wait_for_tasks(WAIT).unwrap();
    let report = model.compute_next_step(&[], DT).unwrap();
    pool.shutdown();

    assert_eq!(report.fired_reactions, 1);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].vertex, 26);
    assert!(events[0].distance > 0.001);
}
