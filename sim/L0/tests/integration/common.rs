//! Shared fixtures.

use std::sync::Arc;
use std::thread::JoinHandle;

use nalgebra::Point3;
use sim_deformable::{Masses, Model, ModelConfig};
use sim_tasks::{PrimFactory, TaskExecutor, WorkerConfig, WorkerExit, WorkerThread};

/// Time step used throughout.
pub const DT: f64 = 0.01;

/// `n³` points on a unit lattice, x varying fastest.
pub fn lattice(n: u32) -> Vec<Point3<f64>> {
    let mut points = Vec::new();
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                points.push(Point3::new(f64::from(x), f64::from(y), f64::from(z)));
            }
        }
    }
    points
}

/// Unit-mass lattice model.
pub fn lattice_model(n: u32, config: ModelConfig, factory: Arc<dyn PrimFactory>) -> Model {
    Model::from_positions(&lattice(n), Masses::Constant(1.0), config, factory).unwrap()
}

/// Worker threads serving a set of executors.
pub struct WorkerPool {
    workers: Vec<(Arc<WorkerThread>, JoinHandle<WorkerExit>)>,
}

impl WorkerPool {
    /// Spawn `size` workers, each attached to every executor.
    pub fn spawn(size: usize, executors: &[Arc<dyn TaskExecutor>]) -> Self {
        let workers = (0..size)
            .map(|i| {
                let config = WorkerConfig::named(format!("pool-{i}"));
                let worker = Arc::new(WorkerThread::new(config));
                for executor in executors {
                    worker.add_executor(Arc::clone(executor));
                }
                let handle = worker.spawn().unwrap();
                (worker, handle)
            })
            .collect();
        Self { workers }
    }

    /// Stop every worker and collect the exit reasons.
    pub fn shutdown(self) -> Vec<WorkerExit> {
        for (worker, _) in &self.workers {
            worker.stop();
        }
        self.workers
            .into_iter()
            .map(|(_, handle)| handle.join().unwrap())
            .collect()
    }
}
