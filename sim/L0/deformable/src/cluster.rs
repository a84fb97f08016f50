//! Shape matching over one cluster of vertices.
//!
//! A [`Cluster`] references its member vertices by index into the model's
//! vertex arena and stores, per member, the offset from the cluster's center
//! of mass at construction and the current equilibrium offset (the initial
//! offset after plastic flow). Every step it:
//!
//! 1. updates the center of mass from current positions
//! 2. computes `Apq = Σ mᵢ (xᵢ − c) qᵢᵀ`
//! 3. computes `A = Apq · Aqq⁻¹` and normalizes its volume
//! 4. factors `A = R·S`
//! 5. lets the rest shape creep toward `S` when the strain exceeds the yield
//!    threshold
//! 6. computes goal positions `gᵢ = c + R·qᵢ` and velocity corrections
//!    `(gᵢ − xᵢ)·α/dt`, optionally blended toward rigid motion
//!
//! Corrections are written to a per-cluster buffer. The model folds all
//! buffers into the vertices after every cluster has run, so clusters running
//! on different threads never write shared vertex state.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};
use tracing::{debug, error, warn};

use crate::body::{Body, PointMass};
use crate::config::ClusterConfig;
use crate::error::{DeformableError, Result};
use crate::math::{
    VolumeNormalization, normalize_volume, outer, polar_decomposition, strain_magnitude,
};
use crate::types::Vertex;

/// Symmetric terms with a smaller norm have no spatial extent.
const EXTENT_EPSILON: f64 = 1e-12;

/// A member vertex of a cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterMember {
    /// Index into the model's vertex arena.
    pub vertex: usize,
    /// Mass at the time the vertex was added.
    pub mass: f64,
    /// Offset from the center of mass at construction.
    pub initial_offset: Vector3<f64>,
    /// Rest offset after plastic flow.
    pub equilibrium_offset: Vector3<f64>,
}

impl ClusterMember {
    /// Rest position relative to a center of mass.
    #[must_use]
    pub fn equilibrium_position(&self, center_of_mass: &Point3<f64>) -> Point3<f64> {
        center_of_mass + self.equilibrium_offset
    }
}

/// Outcome of the last [`Cluster::run_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterStatus {
    /// Not stepped yet.
    #[default]
    Pending,
    /// Matched normally.
    Matched,
    /// Transformation had a negative determinant; the cluster is inside out.
    Inverted,
    /// Transformation determinant was close to zero; volume normalization
    /// was skipped.
    Degenerate,
    /// Cluster has no spatial extent and is skipped.
    Invalid,
}

/// A shape-matched cluster of vertices.
#[derive(Debug, Clone)]
pub struct Cluster {
    config: ClusterConfig,
    members: Vec<ClusterMember>,
    total_mass: f64,
    initial_center_of_mass: Point3<f64>,
    center_of_mass: Point3<f64>,
    frozen: bool,
    valid: bool,
    symmetric_term_inverse: Option<Matrix3<f64>>,
    asymmetric_term: Matrix3<f64>,
    linear_transformation: Matrix3<f64>,
    rotation: Matrix3<f64>,
    scale: Matrix3<f64>,
    plastic_deformation: Matrix3<f64>,
    corrections: Vec<(usize, Vector3<f64>)>,
    status: ClusterStatus,
}

impl Cluster {
    /// Create an empty cluster.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            members: Vec::new(),
            total_mass: 0.0,
            initial_center_of_mass: Point3::origin(),
            center_of_mass: Point3::origin(),
            frozen: false,
            valid: true,
            symmetric_term_inverse: None,
            asymmetric_term: Matrix3::zeros(),
            linear_transformation: Matrix3::identity(),
            rotation: Matrix3::identity(),
            scale: Matrix3::identity(),
            plastic_deformation: Matrix3::identity(),
            corrections: Vec::new(),
            status: ClusterStatus::Pending,
        }
    }

    /// Add a member vertex.
    ///
    /// The center of mass moves toward the new vertex; all stored offsets are
    /// shifted so that `Σ mᵢ·qᵢ = 0` keeps holding.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvariantViolation`] if the cluster is
    /// frozen and [`DeformableError::InvalidMass`] for a non-positive mass.
    pub fn add_vertex(&mut self, vertex: usize, position: Point3<f64>, mass: f64) -> Result<()> {
        if self.frozen {
            error!(vertex, "Vertex added to a frozen cluster");
            return Err(DeformableError::invariant_violation(
                "cannot add a vertex to a frozen cluster",
            ));
        }
        if mass <= 0.0 || !mass.is_finite() {
            return Err(DeformableError::invalid_mass(format!(
                "vertex {vertex} has mass {mass}"
            )));
        }

        let new_total = self.total_mass + mass;
        let new_center = Point3::from(
            (self.center_of_mass.coords * self.total_mass + position.coords * mass) / new_total,
        );
        let shift = new_center - self.center_of_mass;
        for member in &mut self.members {
            member.initial_offset -= shift;
            member.equilibrium_offset -= shift;
        }

        let offset = position - new_center;
        self.members.push(ClusterMember {
            vertex,
            mass,
            initial_offset: offset,
            equilibrium_offset: offset,
        });
        self.total_mass = new_total;
        self.center_of_mass = new_center;
        self.initial_center_of_mass = new_center;
        self.symmetric_term_inverse = None;
        Ok(())
    }

    /// Close the cluster against membership changes.
    ///
    /// A cluster without spatial extent (a single vertex, coincident
    /// vertices) is marked invalid and skipped from then on.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.valid = self.symmetric_term_inverse().is_some();
        if !self.valid {
            debug!(
                members = self.members.len(),
                "Cluster has no extent, skipped"
            );
            self.status = ClusterStatus::Invalid;
        }
    }

    /// Check if the cluster is frozen.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Check if the cluster takes part in shape matching.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Coefficients of this cluster.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Member records in insertion order.
    #[must_use]
    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the cluster has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a vertex is a member.
    #[must_use]
    pub fn contains_vertex(&self, vertex: usize) -> bool {
        self.members.iter().any(|m| m.vertex == vertex)
    }

    /// Sum of member masses.
    #[must_use]
    pub const fn total_mass(&self) -> f64 {
        self.total_mass
    }

    /// Current center of mass.
    #[must_use]
    pub const fn center_of_mass(&self) -> &Point3<f64> {
        &self.center_of_mass
    }

    /// Center of mass at construction.
    #[must_use]
    pub const fn initial_center_of_mass(&self) -> &Point3<f64> {
        &self.initial_center_of_mass
    }

    /// Rotation from the last step.
    #[must_use]
    pub const fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    /// Symmetric stretch from the last step.
    #[must_use]
    pub const fn scale(&self) -> &Matrix3<f64> {
        &self.scale
    }

    /// Volume-normalized linear transformation from the last step.
    #[must_use]
    pub const fn linear_transformation(&self) -> &Matrix3<f64> {
        &self.linear_transformation
    }

    /// `Apq` from the last step.
    #[must_use]
    pub const fn asymmetric_term(&self) -> &Matrix3<f64> {
        &self.asymmetric_term
    }

    /// Accumulated plastic deformation; equilibrium offsets are this matrix
    /// applied to the initial offsets.
    #[must_use]
    pub const fn plastic_deformation(&self) -> &Matrix3<f64> {
        &self.plastic_deformation
    }

    /// Outcome of the last step.
    #[must_use]
    pub const fn status(&self) -> ClusterStatus {
        self.status
    }

    /// Velocity corrections `(vertex, correction)` from the last step.
    #[must_use]
    pub fn corrections(&self) -> &[(usize, Vector3<f64>)] {
        &self.corrections
    }

    /// Discard the corrections of the last step.
    pub fn clear_corrections(&mut self) {
        self.corrections.clear();
    }

    /// Recompute the center of mass from current positions.
    ///
    /// Leaves the center unchanged, with a warning, if the cluster has no
    /// mass.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if a member index is not
    /// in `vertices`.
    pub fn update_center_of_mass(&mut self, vertices: &[Vertex]) -> Result<()> {
        if self.total_mass <= 0.0 {
            warn!("Cluster has zero mass, center of mass unchanged");
            return Ok(());
        }
        let mut weighted = Vector3::zeros();
        for member in &self.members {
            weighted += member_vertex(vertices, member)?.position.coords * member.mass;
        }
        self.center_of_mass = Point3::from(weighted / self.total_mass);
        Ok(())
    }

    /// Compute `Apq = Σ mᵢ (xᵢ − c) qᵢᵀ`.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if a member index is not
    /// in `vertices`.
    pub fn compute_asymmetric_term(&mut self, vertices: &[Vertex]) -> Result<()> {
        let mut apq = Matrix3::zeros();
        for member in &self.members {
            let p = member_vertex(vertices, member)?.position - self.center_of_mass;
            apq += outer(&p, &member.equilibrium_offset) * member.mass;
        }
        self.asymmetric_term = apq;
        Ok(())
    }

    /// `Aqq⁻¹`, computed on first use after the equilibrium offsets change.
    ///
    /// Flat or collinear clusters get the pseudo-inverse. Returns `None` if
    /// the cluster has no extent at all.
    pub fn symmetric_term_inverse(&mut self) -> Option<Matrix3<f64>> {
        if self.symmetric_term_inverse.is_none() {
            self.symmetric_term_inverse = self.compute_symmetric_term_inverse();
        }
        self.symmetric_term_inverse
    }

    fn compute_symmetric_term_inverse(&self) -> Option<Matrix3<f64>> {
        let aqq = self.members.iter().fold(Matrix3::zeros(), |acc, m| {
            acc + outer(&m.equilibrium_offset, &m.equilibrium_offset) * m.mass
        });
        if aqq.norm() <= EXTENT_EPSILON {
            return None;
        }
        aqq.try_inverse()
            .filter(|inv| inv.iter().all(|x| x.is_finite()))
            .or_else(|| aqq.pseudo_inverse(EXTENT_EPSILON).ok())
    }

    /// Compute the volume-normalized `A = Apq · Aqq⁻¹`.
    ///
    /// Marks the cluster invalid if it has no extent.
    pub fn compute_linear_transformation(&mut self) -> ClusterStatus {
        let Some(aqq_inv) = self.symmetric_term_inverse() else {
            self.valid = false;
            return ClusterStatus::Invalid;
        };

        let (matrix, status) = match normalize_volume(&(self.asymmetric_term * aqq_inv)) {
            VolumeNormalization::Normalized(m) => (m, ClusterStatus::Matched),
            VolumeNormalization::Inverted(m) => (m, ClusterStatus::Inverted),
            VolumeNormalization::Degenerate(m) => (m, ClusterStatus::Degenerate),
        };
        if status != self.status {
            match status {
                ClusterStatus::Inverted => {
                    warn!(center = ?self.center_of_mass, "Cluster is inverted");
                }
                ClusterStatus::Degenerate => {
                    warn!(center = ?self.center_of_mass, "Degenerate cluster transformation");
                }
                _ => {}
            }
        }
        self.linear_transformation = matrix;
        status
    }

    /// Run one shape-matching step, filling [`corrections`](Self::corrections).
    ///
    /// Invalid clusters produce no corrections.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidConfig`] for a non-positive `dt`,
    /// [`DeformableError::IndexOutOfBounds`] for a member index not in
    /// `vertices` and [`DeformableError::NumericalError`] if the
    /// transformation is not finite.
    pub fn run_step(&mut self, vertices: &[Vertex], dt: f64) -> Result<ClusterStatus> {
        self.corrections.clear();
        if !self.valid {
            self.status = ClusterStatus::Invalid;
            return Ok(self.status);
        }
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(DeformableError::invalid_config(format!(
                "time step must be positive, got {dt}"
            )));
        }

        self.update_center_of_mass(vertices)?;
        self.compute_asymmetric_term(vertices)?;
        let status = self.compute_linear_transformation();
        if status == ClusterStatus::Invalid {
            self.status = status;
            return Ok(status);
        }

        let polar = polar_decomposition(&self.linear_transformation)?;
        self.rotation = polar.rotation;
        self.scale = polar.scale;

        if status != ClusterStatus::Degenerate && self.config.is_plastic() {
            self.apply_plasticity(dt);
        }

        self.compute_corrections(vertices, dt)?;
        self.status = status;
        Ok(status)
    }

    /// Let the rest shape creep toward the current stretch.
    ///
    /// Returns `true` if the strain exceeded the yield threshold.
    pub fn apply_plasticity(&mut self, dt: f64) -> bool {
        if strain_magnitude(&self.scale) <= self.config.yield_threshold {
            return false;
        }

        let identity = Matrix3::identity();
        let creep = (self.config.creep_speed * dt).clamp(0.0, 1.0);
        let flow = identity + (self.scale - identity) * creep;
        let mut plastic = flow * self.plastic_deformation;
        if let VolumeNormalization::Normalized(m) = normalize_volume(&plastic) {
            plastic = m;
        }

        let deviation = plastic - identity;
        let amount = deviation.norm();
        if amount > self.config.max_deformation {
            plastic = identity + deviation * (self.config.max_deformation / amount);
        }

        self.plastic_deformation = plastic;
        self.refresh_equilibrium();
        true
    }

    /// Move the plastic deformation back toward the original shape.
    /// `amount` is clamped to [0, 1]; 1 restores the original shape.
    pub fn repair(&mut self, amount: f64) {
        let amount = amount.clamp(0.0, 1.0);
        if amount <= 0.0 {
            return;
        }
        let identity = Matrix3::identity();
        self.plastic_deformation += (identity - self.plastic_deformation) * amount;
        self.refresh_equilibrium();
    }

    /// Affine map from the construction frame to the current frame:
    /// `x ↦ c + R·P·(x − c₀)`.
    #[must_use]
    pub fn transform(&self) -> Matrix4<f64> {
        let linear = self.rotation * self.plastic_deformation;
        let translation = self.center_of_mass.coords - linear * self.initial_center_of_mass.coords;
        let mut m = linear.to_homogeneous();
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
        m
    }

    /// Distance of a vertex from where this cluster's current frame puts its
    /// construction position.
    #[must_use]
    pub fn deformation_of(&self, vertex: &Vertex) -> f64 {
        let linear = self.rotation * self.plastic_deformation;
        let expected =
            self.center_of_mass + linear * (vertex.initial_position - self.initial_center_of_mass);
        (vertex.position - expected).norm()
    }

    fn refresh_equilibrium(&mut self) {
        for member in &mut self.members {
            member.equilibrium_offset = self.plastic_deformation * member.initial_offset;
        }
        self.symmetric_term_inverse = None;
    }

    fn compute_corrections(&mut self, vertices: &[Vertex], dt: f64) -> Result<()> {
        let gain = self.config.goal_speed_constant / dt;
        for member in &self.members {
            let goal = self.center_of_mass + self.rotation * member.equilibrium_offset;
            let position = member_vertex(vertices, member)?.position;
            self.corrections
                .push((member.vertex, (goal - position) * gain));
        }

        if self.config.linear_elasticity > 0.0 {
            self.blend_toward_rigid(vertices)?;
        }
        Ok(())
    }

    /// Blend the corrected member velocities toward the cluster's rigid
    /// motion and store the result back as corrections.
    fn blend_toward_rigid(&mut self, vertices: &[Vertex]) -> Result<()> {
        let mut points = Vec::with_capacity(self.members.len());
        for (member, (_, correction)) in self.members.iter().zip(&self.corrections) {
            let v = member_vertex(vertices, member)?;
            points.push(PointMass::new(
                v.position,
                v.velocity + correction,
                member.mass,
            ));
        }

        let mut body = Body::new(points);
        let target = body.fit_rigid_motion()?;
        body.set_rigid_motion(&target, self.config.linear_elasticity);

        for ((member, (_, correction)), point) in self
            .members
            .iter()
            .zip(&mut self.corrections)
            .zip(body.points())
        {
            *correction = point.velocity - member_vertex(vertices, member)?.velocity;
        }
        Ok(())
    }
}

fn member_vertex<'a>(vertices: &'a [Vertex], member: &ClusterMember) -> Result<&'a Vertex> {
    vertices.get(member.vertex).ok_or_else(|| {
        DeformableError::index_out_of_bounds(format!(
            "cluster member {} of {} vertices",
            member.vertex, vertices.len()
        ))
    })
}
