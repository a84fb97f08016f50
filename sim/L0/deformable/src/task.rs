//! State shared between the model and its cluster tasks.
//!
//! Cluster tasks only read the vertex arena and write their own cluster, so
//! any number of them run concurrently under the read lock. The model takes
//! the write lock after the queue barrier to fold corrections and integrate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sim_tasks::Job;

use crate::cluster::Cluster;
use crate::types::Vertex;

/// Vertices, clusters and the current time step.
#[derive(Debug)]
pub(crate) struct SharedState {
    vertices: RwLock<Vec<Vertex>>,
    clusters: Vec<Mutex<Cluster>>,
    dt_bits: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(vertices: Vec<Vertex>, clusters: Vec<Cluster>) -> Self {
        Self {
            vertices: RwLock::new(vertices),
            clusters: clusters.into_iter().map(Mutex::new).collect(),
            dt_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub(crate) fn dt(&self) -> f64 {
        f64::from_bits(self.dt_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_dt(&self, dt: f64) {
        self.dt_bits.store(dt.to_bits(), Ordering::Release);
    }

    pub(crate) fn vertices(&self) -> RwLockReadGuard<'_, Vec<Vertex>> {
        self.vertices.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn vertices_mut(&self) -> RwLockWriteGuard<'_, Vec<Vertex>> {
        self.vertices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub(crate) fn cluster(&self, index: usize) -> Option<MutexGuard<'_, Cluster>> {
        self.clusters
            .get(index)
            .map(|c| c.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn clusters(&self) -> impl Iterator<Item = MutexGuard<'_, Cluster>> {
        self.clusters
            .iter()
            .map(|c| c.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Deformation of a vertex relative to its nearest cluster, or its plain
    /// displacement if it has none.
    pub(crate) fn deformation_of(&self, vertex: &Vertex) -> f64 {
        vertex
            .nearest_cluster()
            .and_then(|k| self.cluster(k))
            .map_or_else(
                || vertex.displacement().norm(),
                |c| c.deformation_of(vertex),
            )
    }
}

/// Shape matching of one cluster, run once per step.
pub struct ClusterTask {
    state: Arc<SharedState>,
    cluster: usize,
}

impl ClusterTask {
    pub(crate) fn new(state: Arc<SharedState>, cluster: usize) -> Self {
        Self { state, cluster }
    }

    /// Index of the cluster this task matches.
    #[must_use]
    pub const fn cluster(&self) -> usize {
        self.cluster
    }
}

impl Job for ClusterTask {
    fn run(&self) -> Result<(), String> {
        let vertices = self.state.vertices();
        let mut cluster = self
            .state
            .cluster(self.cluster)
            .ok_or_else(|| format!("cluster {} does not exist", self.cluster))?;
        cluster
            .run_step(&vertices, self.state.dt())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for ClusterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTask")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}
