//! Deformable model: vertices, clusters and the per-step schedule.
//!
//! A step runs in two phases separated by the task queue barrier:
//!
//! ```text
//! prepare_tasks(dt) ─▶ ClusterTask × clusters   (workers or drain)
//!                      reads vertices, fills each cluster's corrections
//!                            │
//!                   wait_till_emptied
//!                            ▼
//! compute_next_step(forces, dt):
//!   fold corrections ▶ forces ▶ damping/clamp ▶ rigidity ▶ move ▶ reactions
//! ```
//!
//! Only the fold writes the per-vertex accumulators, and it runs on the
//! driver thread after every cluster task has finished.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use sim_tasks::{PrimFactory, Task, TaskError, TaskExecutor, TaskQueue, drain};
use tracing::{debug, info};

use crate::body::{Body, RigidMotion};
use crate::cluster::{Cluster, ClusterStatus};
use crate::clustering::partition;
use crate::config::ModelConfig;
use crate::error::{DeformableError, Result};
use crate::force::Force;
use crate::layout::{CoordinateTransform, VertexLayout};
use crate::reaction::{
    HitReaction, ReactionId, Reactions, RegionReaction, ShapeDeformationReaction,
    StretchReaction,
};
use crate::region::Region;
use crate::task::{ClusterTask, SharedState};
use crate::types::{Vertex, VertexFlags};

/// How long [`Model::step`] waits for cluster tasks still held by workers.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Vertex masses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Masses<'a> {
    /// The same mass for every vertex.
    Constant(f64),
    /// One mass per vertex.
    PerVertex(&'a [f64]),
}

/// Everything needed to build a model from an external vertex buffer.
#[derive(Debug, Clone, Copy)]
pub struct ModelDescriptor<'a> {
    /// Vertex records.
    pub source: &'a [u8],
    /// Number of records to read.
    pub vertex_count: usize,
    /// Record layout.
    pub layout: &'a VertexLayout,
    /// Vertex masses.
    pub masses: Masses<'a>,
    /// Model configuration.
    pub config: ModelConfig,
}

impl<'a> ModelDescriptor<'a> {
    /// Describe `vertex_count` records of unit mass with the default
    /// configuration.
    #[must_use]
    pub fn new(source: &'a [u8], vertex_count: usize, layout: &'a VertexLayout) -> Self {
        Self {
            source,
            vertex_count,
            layout,
            masses: Masses::Constant(1.0),
            config: ModelConfig::default(),
        }
    }

    /// Set the masses.
    #[must_use]
    pub const fn with_masses(mut self, masses: Masses<'a>) -> Self {
        self.masses = masses;
        self
    }

    /// Set the configuration.
    #[must_use]
    pub const fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }
}

/// Outcome of [`Model::compute_next_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Change of the whole body's linear velocity over the step.
    pub linear_velocity_change: Vector3<f64>,
    /// Change of the whole body's angular velocity over the step.
    pub angular_velocity_change: Vector3<f64>,
    /// Reactions that fired after the step.
    pub fired_reactions: usize,
    /// Clusters skipped because they have no extent.
    pub invalid_clusters: usize,
    /// Clusters that matched an inside-out shape.
    pub inverted_clusters: usize,
}

impl Default for StepReport {
    fn default() -> Self {
        Self {
            linear_velocity_change: Vector3::zeros(),
            angular_velocity_change: Vector3::zeros(),
            fired_reactions: 0,
            invalid_clusters: 0,
            inverted_clusters: 0,
        }
    }
}

/// Outcome of [`Model::hit`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HitReport {
    /// Vertices inside the hit region, sorted.
    pub hit_vertices: Vec<usize>,
    /// Hit reactions that fired.
    pub fired_reactions: usize,
}

/// A shape-matching deformable model.
pub struct Model {
    state: Arc<SharedState>,
    config: ModelConfig,
    factory: Arc<dyn PrimFactory>,
    queue: Option<Arc<TaskQueue>>,
    extra_points: Vec<Vec<Point3<f64>>>,
    extra_vectors: Vec<Vec<Vector3<f64>>>,
    point_fields: usize,
    vector_fields: usize,
    reactions: Reactions,
    steps: u64,
}

impl Model {
    /// Build a model from an external vertex buffer.
    ///
    /// Positions and the extra fields named by the layout are read once;
    /// vertices are then partitioned into clusters.
    ///
    /// # Errors
    ///
    /// - [`DeformableError::InvalidLayout`] for a bad layout or short buffer.
    /// - [`DeformableError::InvalidConfig`] for an invalid configuration or a
    ///   mass list of the wrong length.
    /// - [`DeformableError::InvalidMass`] for a non-positive mass.
    pub fn new(descriptor: &ModelDescriptor<'_>, factory: Arc<dyn PrimFactory>) -> Result<Self> {
        let layout = descriptor.layout;
        let count = descriptor.vertex_count;
        layout.validate()?;
        layout.check_buffer(descriptor.source, count)?;
        let masses = vertex_masses(descriptor.masses, count)?;

        let mut vertices = Vec::with_capacity(count);
        let mut extra_points = Vec::with_capacity(count);
        let mut extra_vectors = Vec::with_capacity(count);
        for (i, mass) in masses.into_iter().enumerate() {
            let position = layout.read_position(descriptor.source, i)?;
            vertices.push(Vertex::new(position, mass));
            extra_points.push(layout.read_points(descriptor.source, i)?);
            extra_vectors.push(layout.read_vectors(descriptor.source, i)?);
        }

        let mut model = Self::build(vertices, descriptor.config, factory)?;
        model.extra_points = extra_points;
        model.extra_vectors = extra_vectors;
        model.point_fields = layout.point_offsets().len();
        model.vector_fields = layout.vector_offsets().len();
        Ok(model)
    }

    /// Build a model from positions, without extra fields.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new), except for layout errors.
    pub fn from_positions(
        positions: &[Point3<f64>],
        masses: Masses<'_>,
        config: ModelConfig,
        factory: Arc<dyn PrimFactory>,
    ) -> Result<Self> {
        let masses = vertex_masses(masses, positions.len())?;
        let vertices = positions
            .iter()
            .zip(masses)
            .map(|(p, m)| Vertex::new(*p, m))
            .collect();
        Self::build(vertices, config, factory)
    }

    fn build(
        mut vertices: Vec<Vertex>,
        config: ModelConfig,
        factory: Arc<dyn PrimFactory>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let clusters = partition(&mut vertices, &config.grid, &config.cluster)?;
        let count = vertices.len();
        info!(
            vertices = count,
            clusters = clusters.len(),
            multithreaded = factory.is_multithreaded(),
            "Created deformable model"
        );
        Ok(Self {
            state: Arc::new(SharedState::new(vertices, clusters)),
            config,
            factory,
            queue: None,
            extra_points: vec![Vec::new(); count],
            extra_vectors: vec![Vec::new(); count],
            point_fields: 0,
            vector_fields: 0,
            reactions: Reactions::new(),
            steps: 0,
        })
    }

    /// Model configuration (validated).
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.state.vertices().len()
    }

    /// Number of clusters, valid or not.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.state.cluster_count()
    }

    /// Number of completed steps.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.steps
    }

    /// Copy of one vertex.
    #[must_use]
    pub fn vertex(&self, index: usize) -> Option<Vertex> {
        self.state.vertices().get(index).copied()
    }

    /// Copy of every vertex.
    #[must_use]
    pub fn vertices(&self) -> Vec<Vertex> {
        self.state.vertices().clone()
    }

    /// Current vertex positions.
    #[must_use]
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.state.vertices().iter().map(|v| v.position).collect()
    }

    /// Run `f` on a cluster.
    pub fn with_cluster<R>(&self, index: usize, f: impl FnOnce(&Cluster) -> R) -> Option<R> {
        self.state.cluster(index).map(|c| f(&c))
    }

    /// Affine map from a cluster's construction frame to its current frame,
    /// e.g. for GPU skinning.
    #[must_use]
    pub fn cluster_transform(&self, index: usize) -> Option<Matrix4<f64>> {
        self.with_cluster(index, Cluster::transform)
    }

    /// Deformation of a vertex measured in its nearest cluster's frame.
    #[must_use]
    pub fn deformation_of(&self, index: usize) -> Option<f64> {
        let vertex = self.vertex(index)?;
        Some(self.state.deformation_of(&vertex))
    }

    /// Rigid motion that best fits all vertex velocities.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::Degenerate`] for a model without mass.
    pub fn body_motion(&self) -> Result<RigidMotion> {
        let vertices = self.state.vertices();
        Body::from_vertices(&vertices, 0..vertices.len())?.fit_rigid_motion()
    }

    /// Registered reactions.
    #[must_use]
    pub const fn reactions(&self) -> &Reactions {
        &self.reactions
    }

    /// Build the cluster tasks for a step, or re-arm them, and return the
    /// queue workers should drain.
    ///
    /// The first call pushes one task per cluster; later calls reset the
    /// same queue.
    ///
    /// # Errors
    ///
    /// - [`DeformableError::InvalidConfig`] for a non-positive `dt`.
    /// - [`TaskError::QueueNotEmpty`] if the previous step's tasks are still
    ///   queued or running.
    pub fn prepare_tasks(&mut self, dt: f64) -> Result<Arc<TaskQueue>> {
        check_time_step(dt)?;
        if let Some(queue) = &self.queue {
            queue.reset()?;
            self.state.set_dt(dt);
            return Ok(Arc::clone(queue));
        }

        self.state.set_dt(dt);
        let count = self.state.cluster_count();
        let queue = Arc::new(TaskQueue::new("clusters", count, self.factory.as_ref()));
        for cluster in 0..count {
            let job = ClusterTask::new(Arc::clone(&self.state), cluster);
            queue.push(Arc::new(Task::new(format!("cluster {cluster}"), job)))?;
        }
        debug!(tasks = count, "Built cluster tasks");
        self.queue = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Block until every cluster task of the current step has finished.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskQueue::wait_till_emptied`] failures.
    pub fn wait_for_tasks(&self, timeout: Duration) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.wait_till_emptied(timeout)?;
        }
        Ok(())
    }

    /// Second phase of a step: fold the cluster corrections into the
    /// vertices, integrate `forces` and run the reactions.
    ///
    /// # Errors
    ///
    /// - [`DeformableError::InvalidConfig`] for a non-positive `dt`.
    /// - [`TaskError::Aborted`] if a cluster task failed this step.
    /// - [`TaskError::QueueNotEmpty`] if cluster tasks have not finished.
    /// - [`DeformableError::InvariantViolation`] for a correction to a vertex
    ///   no cluster claims.
    pub fn compute_next_step(&mut self, forces: &[Force], dt: f64) -> Result<StepReport> {
        check_time_step(dt)?;
        if let Some(queue) = &self.queue {
            if queue.is_aborted() {
                return Err(TaskError::Aborted.into());
            }
            if !queue.is_emptied() {
                return Err(TaskError::QueueNotEmpty {
                    pending: queue.pending(),
                }
                .into());
            }
        }

        let mut report = StepReport::default();
        let mut vertices = self.state.vertices_mut();
        let before = rigid_motion_of(&vertices);

        for mut cluster in self.state.clusters() {
            match cluster.status() {
                ClusterStatus::Invalid => report.invalid_clusters += 1,
                ClusterStatus::Inverted => report.inverted_clusters += 1,
                _ => {}
            }
            fold_corrections(&mut vertices, cluster.corrections())?;
            cluster.clear_corrections();
        }

        integrate_velocities(&mut vertices, forces, &self.config, dt);
        if self.config.rigidity > 0.0 {
            rigidify(&mut vertices, self.config.rigidity)?;
        }
        for vertex in vertices.iter_mut() {
            let velocity = vertex.velocity;
            vertex.position += velocity * dt;
        }
        for mut cluster in self.state.clusters() {
            if cluster.is_valid() {
                cluster.update_center_of_mass(&vertices)?;
            }
        }

        let after = rigid_motion_of(&vertices);
        report.linear_velocity_change = after.linear - before.linear;
        report.angular_velocity_change = after.angular - before.angular;
        drop(vertices);

        let vertices = self.state.vertices();
        let state = &*self.state;
        report.fired_reactions = self.reactions.invoke_after_step(
            |i| vertices.get(i).map(|v| v.position),
            |i| vertices.get(i).map_or(0.0, |v| state.deformation_of(v)),
        );
        drop(vertices);

        self.steps += 1;
        debug!(
            step = self.steps,
            fired_reactions = report.fired_reactions,
            invalid_clusters = report.invalid_clusters,
            inverted_clusters = report.inverted_clusters,
            "Step complete"
        );
        Ok(report)
    }

    /// Run a whole step on the calling thread: prepare, drain, compute.
    ///
    /// Workers attached to the queue may take part; the step waits up to
    /// [`DEFAULT_STEP_TIMEOUT`] for them.
    ///
    /// # Errors
    ///
    /// Any error of the three phases. A failing cluster task aborts the
    /// queue and is returned as [`TaskError::TaskFailed`].
    pub fn step(&mut self, forces: &[Force], dt: f64) -> Result<StepReport> {
        let queue = self.prepare_tasks(dt)?;
        drain(queue.as_ref())?;
        self.wait_for_tasks(DEFAULT_STEP_TIMEOUT)?;
        self.compute_next_step(forces, dt)
    }

    /// Add `velocity` to every vertex inside `region` and fire the hit
    /// reactions with that set.
    ///
    /// Pinned vertices are marked hit but keep their velocity.
    pub fn hit(&mut self, region: &Region, velocity: &Vector3<f64>) -> HitReport {
        let mut hit = HashSet::new();
        for (i, vertex) in self.state.vertices_mut().iter_mut().enumerate() {
            vertex.flags.remove(VertexFlags::HIT);
            if region.contains(&vertex.position) {
                vertex.flags.insert(VertexFlags::HIT);
                if !vertex.is_pinned() {
                    vertex.velocity += velocity;
                }
                hit.insert(i);
            }
        }

        let fired_reactions = self.reactions.invoke_hit(&hit, velocity);
        let mut hit_vertices: Vec<usize> = hit.into_iter().collect();
        hit_vertices.sort_unstable();
        debug!(vertices = hit_vertices.len(), fired_reactions, "Hit");
        HitReport {
            hit_vertices,
            fired_reactions,
        }
    }

    /// Move the plastic deformation of every cluster whose center lies in
    /// `region` back toward the original shape. Returns the number of
    /// clusters repaired.
    pub fn repair(&mut self, amount: f64, region: &Region) -> usize {
        let mut repaired = 0;
        for mut cluster in self.state.clusters() {
            if region.contains(cluster.center_of_mass()) {
                cluster.repair(amount);
                repaired += 1;
            }
        }
        debug!(repaired, amount, "Repaired clusters");
        repaired
    }

    /// Blend every vertex velocity toward the body's rigid motion by
    /// `coeff` ∈ [0, 1].
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::Degenerate`] if no rigid motion fits.
    pub fn set_rigid_motion(&mut self, coeff: f64) -> Result<()> {
        rigidify(&mut self.state.vertices_mut(), coeff)
    }

    /// Pin a vertex in place.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown vertex.
    pub fn pin_vertex(&mut self, index: usize) -> Result<()> {
        self.with_vertex_mut(index, Vertex::pin)
    }

    /// Release a pinned vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown vertex.
    pub fn unpin_vertex(&mut self, index: usize) -> Result<()> {
        self.with_vertex_mut(index, Vertex::unpin)
    }

    fn with_vertex_mut(&self, index: usize, f: impl FnOnce(&mut Vertex)) -> Result<()> {
        let mut vertices = self.state.vertices_mut();
        let count = vertices.len();
        let vertex = vertices.get_mut(index).ok_or_else(|| {
            DeformableError::index_out_of_bounds(format!("vertex {index} of {count}"))
        })?;
        f(vertex);
        Ok(())
    }

    fn check_watched(&self, watched: &[usize]) -> Result<()> {
        let count = self.vertex_count();
        match watched.iter().find(|&&i| i >= count) {
            Some(i) => Err(DeformableError::index_out_of_bounds(format!(
                "reaction watches vertex {i} of {count}"
            ))),
            None => Ok(()),
        }
    }

    /// Register a shape deformation reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if it watches an
    /// unknown vertex.
    pub fn add_shape_deformation_reaction(
        &mut self,
        reaction: ShapeDeformationReaction,
    ) -> Result<ReactionId> {
        self.check_watched(reaction.vertices())?;
        Ok(self.reactions.add_shape_deformation(reaction))
    }

    /// Register a region reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if it watches an
    /// unknown vertex.
    pub fn add_region_reaction(&mut self, reaction: RegionReaction) -> Result<ReactionId> {
        self.check_watched(reaction.vertices())?;
        Ok(self.reactions.add_region(reaction))
    }

    /// Register a hit reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if it watches an
    /// unknown vertex.
    pub fn add_hit_reaction(&mut self, reaction: HitReaction) -> Result<ReactionId> {
        self.check_watched(reaction.vertices())?;
        Ok(self.reactions.add_hit(reaction))
    }

    /// Register a stretch reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if it watches an
    /// unknown vertex.
    pub fn add_stretch_reaction(&mut self, reaction: StretchReaction) -> Result<ReactionId> {
        self.check_watched(reaction.vertices())?;
        Ok(self.reactions.add_stretch(reaction))
    }

    /// Enable or disable a registered reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown id.
    pub fn set_reaction_enabled(&mut self, id: ReactionId, enabled: bool) -> Result<()> {
        self.reactions.set_enabled(id, enabled)
    }

    /// Translate the region of a region reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if `id` is not a
    /// registered region reaction.
    pub fn move_region(&mut self, id: ReactionId, delta: &Vector3<f64>) -> Result<()> {
        let reaction = match id {
            ReactionId::Region(i) => self.reactions.region_mut(i),
            _ => None,
        };
        let reaction = reaction.ok_or_else(|| {
            DeformableError::index_out_of_bounds(format!("{id:?} is not a region reaction"))
        })?;
        reaction.translate_region(delta);
        Ok(())
    }

    /// Write vertices `range` into an external buffer.
    ///
    /// Positions are written as simulated. Extra points follow the frame of
    /// their vertex's nearest cluster and extra vectors its rotation. With a
    /// `transform`, positions and points are mapped to Cartesian space.
    ///
    /// # Errors
    ///
    /// - [`DeformableError::IndexOutOfBounds`] for a range past the last
    ///   vertex.
    /// - [`DeformableError::InvalidLayout`] for a layout whose extra fields
    ///   differ from the construction layout, or a short buffer.
    pub fn update_vertices(
        &self,
        out: &mut [u8],
        layout: &VertexLayout,
        range: Range<usize>,
        transform: Option<&dyn CoordinateTransform>,
    ) -> Result<()> {
        let count = self.vertex_count();
        if range.start > range.end || range.end > count {
            return Err(DeformableError::index_out_of_bounds(format!(
                "vertex range {range:?} of {count}"
            )));
        }
        if layout.point_offsets().len() != self.point_fields
            || layout.vector_offsets().len() != self.vector_fields
        {
            let (points, vectors) = (layout.point_offsets().len(), layout.vector_offsets().len());
            return Err(DeformableError::invalid_layout(format!(
                "layout has {points} points and {vectors} vectors, model has {} and {}",
                self.point_fields, self.vector_fields
            )));
        }
        layout.validate()?;
        layout.check_buffer(out, range.end)?;

        let frames: Vec<(Matrix4<f64>, Matrix3<f64>)> = self
            .state
            .clusters()
            .map(|c| (c.transform(), *c.rotation()))
            .collect();
        let to_output = |p: Point3<f64>| transform.map_or(p, |t| t.to_cartesian(&p));

        let vertices = self.state.vertices();
        for (i, vertex) in vertices
            .iter()
            .enumerate()
            .take(range.end)
            .skip(range.start)
        {
            layout.write_position(out, i, &to_output(vertex.position))?;
            let frame = vertex.nearest_cluster().and_then(|k| frames.get(k));
            for (field, p) in self.extra_points.get(i).into_iter().flatten().enumerate() {
                let moved = frame.map_or(*p, |(m, _)| m.transform_point(p));
                layout.write_point(out, i, field, &to_output(moved))?;
            }
            for (field, v) in self.extra_vectors.get(i).into_iter().flatten().enumerate() {
                let rotated = frame.map_or(*v, |(_, r)| r * v);
                layout.write_vector(out, i, field, &rotated)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("vertices", &self.vertex_count())
            .field("clusters", &self.cluster_count())
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("reactions", &self.reactions.len())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

fn check_time_step(dt: f64) -> Result<()> {
    if dt > 0.0 && dt.is_finite() {
        Ok(())
    } else {
        Err(DeformableError::invalid_config(format!(
            "time step must be positive, got {dt}"
        )))
    }
}

fn vertex_masses(masses: Masses<'_>, count: usize) -> Result<Vec<f64>> {
    match masses {
        Masses::Constant(mass) => Ok(vec![mass; count]),
        Masses::PerVertex(masses) if masses.len() == count => Ok(masses.to_vec()),
        Masses::PerVertex(masses) => Err(DeformableError::invalid_config(format!(
            "{} masses for {count} vertices",
            masses.len()
        ))),
    }
}

/// Add one cluster's corrections to the vertex accumulators.
fn fold_corrections(vertices: &mut [Vertex], corrections: &[(usize, Vector3<f64>)]) -> Result<()> {
    let count = vertices.len();
    for (index, correction) in corrections {
        vertices
            .get_mut(*index)
            .ok_or_else(|| {
                DeformableError::index_out_of_bounds(format!("vertex {index} of {count}"))
            })?
            .add_to_average_velocity_addition(correction)?;
    }
    Ok(())
}

fn integrate_velocities(vertices: &mut [Vertex], forces: &[Force], config: &ModelConfig, dt: f64) {
    let keep = 1.0 - config.damping;
    for vertex in vertices {
        if vertex.is_pinned() {
            vertex.clear_velocity_addition();
            vertex.velocity = Vector3::zeros();
            continue;
        }
        vertex.apply_velocity_addition();
        let force: Vector3<f64> = forces
            .iter()
            .map(|f| f.value_at(&vertex.position, &vertex.velocity))
            .sum();
        vertex.velocity += force / vertex.mass * dt;
        vertex.velocity *= keep;

        let speed = vertex.velocity.norm();
        if speed > config.max_velocity {
            vertex.velocity *= config.max_velocity / speed;
        }
    }
}

fn rigidify(vertices: &mut [Vertex], coeff: f64) -> Result<()> {
    if vertices.is_empty() {
        return Ok(());
    }
    let mut body = Body::from_vertices(vertices, 0..vertices.len())?;
    let target = body.fit_rigid_motion()?;
    body.set_rigid_motion(&target, coeff);
    for (vertex, point) in vertices.iter_mut().zip(body.into_points()) {
        if !vertex.is_pinned() {
            vertex.velocity = point.velocity;
        }
    }
    Ok(())
}

fn rigid_motion_of(vertices: &[Vertex]) -> RigidMotion {
    Body::from_vertices(vertices, 0..vertices.len())
        .and_then(|mut body| body.fit_rigid_motion())
        .unwrap_or_else(|_| RigidMotion::zero())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::layout::{VEC3_SIZE, write_vec3};
    use crate::reaction::{HitEvent, RegionEvent, ShapeDeformationEvent, StretchEvent};
    use approx::assert_relative_eq;
    use sim_tasks::{SingleThreadPrimFactory, ThreadPrimFactory};
    use std::sync::Mutex;

    const DT: f64 = 0.01;

    /// 3×3×3 lattice with unit spacing, x varying fastest.
    fn lattice() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..3 {
                    points.push(Point3::new(f64::from(x), f64::from(y), f64::from(z)));
                }
            }
        }
        points
    }

    fn lattice_model(config: ModelConfig) -> Model {
        Model::from_positions(
            &lattice(),
            Masses::Constant(1.0),
            config,
            Arc::new(SingleThreadPrimFactory),
        )
        .unwrap()
    }

    fn corner() -> Region {
        Region::sphere(Point3::origin(), 0.1)
    }

    fn recorder<E: Copy + Send + 'static>() -> (Arc<Mutex<Vec<E>>>, impl FnMut(&E) + Send + 'static)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |e: &E| sink.lock().unwrap().push(*e))
    }

    #[test]
    fn test_lattice_partition() {
        let model = lattice_model(ModelConfig::default());
        assert_eq!(model.vertex_count(), 27);
        // Padding shares the middle layer between both cells on each axis.
        assert_eq!(model.cluster_count(), 8);
        for i in 0..model.cluster_count() {
            assert_eq!(model.with_cluster(i, Cluster::len), Some(8));
        }
        let center = model.vertex(13).unwrap();
        assert_eq!(center.including_cluster_count(), 8);
        assert!(model.with_cluster(99, Cluster::len).is_none());
    }

    #[test]
    fn test_mass_list_must_match() {
        let result = Model::from_positions(
            &lattice(),
            Masses::PerVertex(&[1.0, 2.0]),
            ModelConfig::default(),
            Arc::new(SingleThreadPrimFactory),
        );
        assert!(matches!(result, Err(DeformableError::InvalidConfig(_))));

        let result = Model::from_positions(
            &lattice(),
            Masses::Constant(0.0),
            ModelConfig::default(),
            Arc::new(SingleThreadPrimFactory),
        );
        assert!(matches!(result, Err(DeformableError::InvalidMass(_))));
    }

    #[test]
    fn test_rest_state_is_stable() {
        let mut model = lattice_model(ModelConfig::default());
        for _ in 0..10 {
            let report = model.step(&[], DT).unwrap();
            assert_eq!(report.invalid_clusters, 0);
            assert_eq!(report.inverted_clusters, 0);
        }
        assert_eq!(model.step_count(), 10);
        for (p, q) in model.positions().iter().zip(lattice()) {
            assert_relative_eq!(*p, q, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_uniform_force_accelerates_body() {
        let mut model = lattice_model(ModelConfig::default());
        let gravity = Force::uniform(Vector3::new(0.0, 0.0, -9.81));

        let report = model.step(&[gravity], DT).unwrap();

        let expected = Vector3::new(0.0, 0.0, -9.81 * DT);
        for v in model.vertices() {
            assert_relative_eq!(v.velocity, expected, epsilon = 1e-9);
            assert_relative_eq!(v.displacement(), expected * DT, epsilon = 1e-9);
        }
        assert_relative_eq!(report.linear_velocity_change, expected, epsilon = 1e-9);
        assert_relative_eq!(
            report.angular_velocity_change,
            Vector3::zeros(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_damping_and_velocity_clamp() {
        let config = ModelConfig::default()
            .with_damping(0.5)
            .with_max_velocity(1.0);
        let mut model = lattice_model(config);
        model.hit(&corner(), &Vector3::new(-10.0, 0.0, 0.0));

        model.step(&[], DT).unwrap();
        let v = model.vertex(0).unwrap();
        assert_relative_eq!(v.velocity.norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pinned_vertex_stays() {
        let mut model = lattice_model(ModelConfig::default());
        model.pin_vertex(0).unwrap();
        let gravity = Force::uniform(Vector3::new(0.0, 0.0, -9.81));
        for _ in 0..5 {
            model.step(&[gravity], DT).unwrap();
        }
        let pinned = model.vertex(0).unwrap();
        assert_eq!(pinned.position, Point3::origin());
        assert_eq!(pinned.velocity, Vector3::zeros());
        assert!(model.vertex(26).unwrap().position.z < 0.0);

        model.unpin_vertex(0).unwrap();
        model.step(&[gravity], DT).unwrap();
        assert!(model.vertex(0).unwrap().position.z < 0.0);
        assert!(model.pin_vertex(27).is_err());
    }

    #[test]
    fn test_displaced_vertex_is_pulled_back() {
        let mut model = lattice_model(ModelConfig::default());
        let report = model.hit(&corner(), &Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(report.hit_vertices, vec![0]);

        model.step(&[], DT).unwrap();
        let before = model.vertex(0).unwrap();
        assert_relative_eq!(before.velocity.x, -1.0, epsilon = 1e-9);
        assert!(model.deformation_of(0).unwrap() > 0.0);

        model.step(&[], DT).unwrap();
        let after = model.vertex(0).unwrap();
        assert!(after.velocity.x > before.velocity.x);
    }

    #[test]
    fn test_fold_averages_overlapping_corrections() {
        let mut vertices = vec![Vertex::new(Point3::origin(), 1.0)];
        vertices[0].set_including_cluster_count(3);
        let correction = Vector3::new(0.3, -0.6, 0.9);
        for _ in 0..3 {
            fold_corrections(&mut vertices, &[(0, correction)]).unwrap();
        }
        assert_relative_eq!(
            *vertices[0].velocity_addition(),
            correction,
            epsilon = 1e-12
        );
        assert!(fold_corrections(&mut vertices, &[(4, correction)]).is_err());
    }

    #[test]
    fn test_compute_before_tasks_finish_is_rejected() {
        let mut model = Model::from_positions(
            &lattice(),
            Masses::Constant(1.0),
            ModelConfig::default(),
            Arc::new(ThreadPrimFactory),
        )
        .unwrap();

        let queue = model.prepare_tasks(DT).unwrap();
        assert_eq!(queue.len(), model.cluster_count());
        let err = model.compute_next_step(&[], DT).unwrap_err();
        assert!(matches!(
            err,
            DeformableError::Task(TaskError::QueueNotEmpty { pending: 8 })
        ));
        assert!(model.prepare_tasks(DT).is_err());

        assert_eq!(drain(queue.as_ref()).unwrap(), 8);
        model.wait_for_tasks(Duration::from_secs(1)).unwrap();
        model.compute_next_step(&[], DT).unwrap();

        // The same queue is re-armed for the next step.
        let again = model.prepare_tasks(DT).unwrap();
        assert!(Arc::ptr_eq(&queue, &again));
        assert_eq!(again.pending(), 8);
    }

    #[test]
    fn test_invalid_time_step() {
        let mut model = lattice_model(ModelConfig::default());
        assert!(matches!(
            model.step(&[], 0.0),
            Err(DeformableError::InvalidConfig(_))
        ));
        assert!(model.prepare_tasks(f64::NAN).is_err());
        assert_eq!(model.step_count(), 0);
    }

    #[test]
    fn test_reactions_fire_once_per_step() {
        let mut model = lattice_model(ModelConfig::default());
        let (regions, on_region) = recorder();
        let whole = Region::aabb(Point3::new(-1.0, -1.0, -1.0), Point3::new(3.0, 3.0, 3.0));
        let region_id = model
            .add_region_reaction(RegionReaction::new(whole, vec![5, 3, 7], true, on_region))
            .unwrap();

        model.step(&[], DT).unwrap();
        let report = model.step(&[], DT).unwrap();
        assert_eq!(report.fired_reactions, 1);
        {
            let events: Vec<RegionEvent> = regions.lock().unwrap().clone();
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|e| e.vertex == 3));
        }

        model
            .move_region(region_id, &Vector3::new(100.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(model.step(&[], DT).unwrap().fired_reactions, 0);

        model.set_reaction_enabled(region_id, false).unwrap();
        assert_eq!(model.reactions().is_enabled(region_id), Some(false));
        assert!(
            model
                .move_region(ReactionId::Hit(0), &Vector3::zeros())
                .is_err()
        );
    }

    #[test]
    fn test_deformation_and_stretch_reactions() {
        let mut model = lattice_model(ModelConfig::default());
        let (deformations, on_deformation) = recorder();
        let (stretches, on_stretch) = recorder();
        model
            .add_shape_deformation_reaction(ShapeDeformationReaction::new(
                vec![0, 1, 2],
                0.005,
                on_deformation,
            ))
            .unwrap();
        model
            .add_stretch_reaction(StretchReaction::new([0, 1], 1.005, on_stretch))
            .unwrap();

        assert_eq!(model.step(&[], DT).unwrap().fired_reactions, 0);
        model.hit(&corner(), &Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(model.step(&[], DT).unwrap().fired_reactions, 2);

        let deformation: ShapeDeformationEvent = deformations.lock().unwrap()[0];
        assert_eq!(deformation.vertex, 0);
        assert!(deformation.distance > 0.005);
        let stretch: StretchEvent = stretches.lock().unwrap()[0];
        assert_eq!(stretch.vertices, [0, 1]);
        assert_relative_eq!(stretch.distance, 1.0 + DT, epsilon = 1e-9);
    }

    #[test]
    fn test_hit_reaction() {
        let mut model = lattice_model(ModelConfig::default());
        let (hits, on_hit) = recorder();
        model
            .add_hit_reaction(HitReaction::new(vec![0, 26], 0.5, on_hit))
            .unwrap();

        let report = model.hit(&corner(), &Vector3::new(0.1, 0.0, 0.0));
        assert_eq!(report.fired_reactions, 0);
        let report = model.hit(&corner(), &Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(report.fired_reactions, 1);
        assert!(model.vertex(0).unwrap().flags.contains(VertexFlags::HIT));
        assert!(!model.vertex(1).unwrap().flags.contains(VertexFlags::HIT));

        let events: Vec<HitEvent> = hits.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].vertex, 0);
        assert_relative_eq!(events[0].speed, 1.0);
    }

    #[test]
    fn test_reaction_on_unknown_vertex_is_rejected() {
        let mut model = lattice_model(ModelConfig::default());
        let result = model.add_stretch_reaction(StretchReaction::new([0, 27], 1.0, |_| {}));
        assert!(matches!(result, Err(DeformableError::IndexOutOfBounds(_))));
        assert!(model.reactions().is_empty());
    }

    #[test]
    fn test_rigid_motion_preserves_momentum() {
        let mut model = lattice_model(ModelConfig::default());
        model.hit(&corner(), &Vector3::new(-1.0, 0.0, 0.0));
        let momentum = |m: &Model| -> Vector3<f64> {
            m.vertices().iter().map(Vertex::momentum).sum()
        };
        let before = momentum(&model);

        model.set_rigid_motion(1.0).unwrap();
        assert_relative_eq!(momentum(&model), before, epsilon = 1e-9);
        assert!(model.vertex(26).unwrap().velocity.norm() > 0.0);

        let motion = model.body_motion().unwrap();
        for v in model.vertices() {
            assert_relative_eq!(v.velocity, motion.velocity_at(&v.position), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_repair_counts_clusters_in_region() {
        let mut model = lattice_model(ModelConfig::default().with_cluster(ClusterConfig::clay()));
        let whole = Region::aabb(Point3::new(-1.0, -1.0, -1.0), Point3::new(3.0, 3.0, 3.0));
        assert_eq!(model.repair(0.5, &whole), 8);
        assert_eq!(model.repair(0.5, &Region::Empty), 0);
        let shifted = corner().translated(&Vector3::new(0.5, 0.5, 0.5));
        assert_eq!(model.repair(1.0, &shifted), 1);
    }

    #[test]
    fn test_cluster_transform_at_rest() {
        let model = lattice_model(ModelConfig::default());
        let m = model.cluster_transform(0).unwrap();
        assert_relative_eq!(m, Matrix4::identity(), epsilon = 1e-12);
        assert!(model.cluster_transform(8).is_none());
    }

    fn record_layout() -> VertexLayout {
        VertexLayout::new(3 * VEC3_SIZE, 0)
            .unwrap()
            .with_point(VEC3_SIZE)
            .unwrap()
            .with_vector(2 * VEC3_SIZE)
            .unwrap()
    }

    fn record_buffer(layout: &VertexLayout) -> Vec<u8> {
        let positions = lattice();
        let mut buffer = vec![0u8; layout.required_len(positions.len()).unwrap()];
        for (i, p) in positions.iter().enumerate() {
            let base = i * layout.stride();
            write_vec3(&mut buffer, base, &p.coords).unwrap();
            write_vec3(&mut buffer, base + VEC3_SIZE, &(p.coords + Vector3::z())).unwrap();
            write_vec3(&mut buffer, base + 2 * VEC3_SIZE, &Vector3::y()).unwrap();
        }
        buffer
    }

    #[test]
    fn test_update_vertices_round_trip() {
        let layout = record_layout();
        let source = record_buffer(&layout);
        let descriptor = ModelDescriptor::new(&source, 27, &layout);
        let model = Model::new(&descriptor, Arc::new(SingleThreadPrimFactory)).unwrap();

        let mut out = vec![0u8; source.len()];
        model
            .update_vertices(&mut out, &layout, 0..27, None)
            .unwrap();
        for i in 0..27 {
            assert_relative_eq!(
                layout.read_position(&out, i).unwrap(),
                layout.read_position(&source, i).unwrap(),
                epsilon = 1e-6
            );
            assert_relative_eq!(
                layout.read_points(&out, i).unwrap()[0],
                layout.read_points(&source, i).unwrap()[0],
                epsilon = 1e-6
            );
            assert_relative_eq!(
                layout.read_vectors(&out, i).unwrap()[0],
                Vector3::y(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_update_vertices_follows_translation() {
        let layout = record_layout();
        let source = record_buffer(&layout);
        let descriptor = ModelDescriptor::new(&source, 27, &layout);
        let mut model = Model::new(&descriptor, Arc::new(SingleThreadPrimFactory)).unwrap();

        let whole = Region::aabb(Point3::new(-1.0, -1.0, -1.0), Point3::new(3.0, 3.0, 3.0));
        model.hit(&whole, &Vector3::new(1.0, 0.0, 0.0));
        model.step(&[], DT).unwrap();

        let mut out = vec![0u8; source.len()];
        let doubled = |p: &Point3<f64>| Point3::from(p.coords * 2.0);
        model
            .update_vertices(&mut out, &layout, 0..27, Some(&doubled))
            .unwrap();

        let shift = Vector3::new(DT, 0.0, 0.0);
        for (i, p) in lattice().iter().enumerate() {
            let position = layout.read_position(&out, i).unwrap();
            assert_relative_eq!(
                position,
                Point3::from((p + shift).coords * 2.0),
                epsilon = 1e-5
            );
            let point = layout.read_points(&out, i).unwrap()[0];
            let expected = p + shift + Vector3::z();
            assert_relative_eq!(point, Point3::from(expected.coords * 2.0), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_update_vertices_rejects_bad_requests() {
        let model = lattice_model(ModelConfig::default());
        let layout = VertexLayout::positions_only();
        let mut out = vec![0u8; layout.required_len(27).unwrap()];

        assert!(matches!(
            model.update_vertices(&mut out, &layout, 20..28, None),
            Err(DeformableError::IndexOutOfBounds(_))
        ));
        assert!(matches!(
            model.update_vertices(&mut out, &record_layout(), 0..27, None),
            Err(DeformableError::InvalidLayout(_))
        ));
        assert!(matches!(
            model.update_vertices(&mut out[..VEC3_SIZE], &layout, 0..27, None),
            Err(DeformableError::InvalidLayout(_))
        ));

        // A partial range leaves other records untouched.
        model
            .update_vertices(&mut out, &layout, 1..2, None)
            .unwrap();
        assert_eq!(layout.read_position(&out, 0).unwrap(), Point3::origin());
        assert_relative_eq!(
            layout.read_position(&out, 1).unwrap(),
            Point3::new(1.0, 0.0, 0.0)
        );
    }

    #[test]
    fn test_descriptor_rejects_short_buffer() {
        let layout = VertexLayout::positions_only();
        let source = vec![0u8; VEC3_SIZE * 2];
        let descriptor = ModelDescriptor::new(&source, 3, &layout);
        let result = Model::new(&descriptor, Arc::new(SingleThreadPrimFactory));
        assert!(result.is_err());
    }

    #[test]
    fn test_descriptor_rejects_overflowing_count() {
        let layout = VertexLayout::positions_only();
        let source = [0u8; VEC3_SIZE];
        let descriptor = ModelDescriptor::new(&source, usize::MAX / 4, &layout);
        assert!(matches!(
            Model::new(&descriptor, Arc::new(SingleThreadPrimFactory)),
            Err(DeformableError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_overflowing_grid_is_rejected() {
        let config = ModelConfig::default().with_grid([usize::MAX, usize::MAX, 1], 0.25);
        let result = Model::from_positions(
            &lattice(),
            Masses::Constant(1.0),
            config,
            Arc::new(SingleThreadPrimFactory),
        );
        assert!(matches!(result, Err(DeformableError::InvalidConfig(_))));
    }
}
