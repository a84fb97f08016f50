//! Core vertex type for shape-matching deformation.
//!
//! - [`Vertex`] - A point mass owned by the model and referenced by index
//!   from every cluster that contains it
//! - [`VertexFlags`] - Per-vertex state (pinned, hit this step)

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DeformableError, Result};

bitflags::bitflags! {
    /// Flags for vertex state and behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct VertexFlags: u32 {
        /// Vertex is pinned: velocity is held at zero during integration.
        const PINNED = 0b0000_0001;
        /// Vertex was inside the region of the last hit.
        const HIT = 0b0000_0010;
    }
}

/// A vertex (point mass) of a deformable model.
///
/// Besides position and velocity, a vertex carries the averaged velocity
/// correction proposed by its clusters during the current step and the number
/// of clusters that reference it. That count is fixed once by the cluster
/// build and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Vertex {
    /// Position in world coordinates.
    pub position: Point3<f64>,
    /// Velocity in world coordinates.
    pub velocity: Vector3<f64>,
    /// Mass of the vertex in kg.
    pub mass: f64,
    /// Position at model construction.
    pub initial_position: Point3<f64>,
    /// Vertex flags.
    pub flags: VertexFlags,
    velocity_addition: Vector3<f64>,
    including_cluster_count: u32,
    nearest_cluster: Option<usize>,
}

impl Vertex {
    /// Create a new vertex at rest.
    #[must_use]
    pub fn new(position: Point3<f64>, mass: f64) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            mass,
            initial_position: position,
            flags: VertexFlags::empty(),
            velocity_addition: Vector3::zeros(),
            including_cluster_count: 0,
            nearest_cluster: None,
        }
    }

    /// Fail unless the mass is usable in mass-weighted computations.
    pub fn check_mass(&self, index: usize) -> Result<()> {
        if self.mass > 0.0 && self.mass.is_finite() {
            Ok(())
        } else {
            Err(DeformableError::invalid_mass(format!(
                "vertex {index} has mass {}",
                self.mass
            )))
        }
    }

    /// Accumulate one cluster's correction, divided by the number of
    /// clusters containing this vertex.
    ///
    /// Once every containing cluster has contributed, the accumulator holds
    /// the average of their corrections.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvariantViolation`] if no cluster was ever
    /// counted for this vertex.
    pub fn add_to_average_velocity_addition(&mut self, correction: &Vector3<f64>) -> Result<()> {
        if self.including_cluster_count == 0 {
            return Err(DeformableError::invariant_violation(
                "correction for a vertex with zero including clusters",
            ));
        }
        self.velocity_addition += correction / f64::from(self.including_cluster_count);
        Ok(())
    }

    /// Current averaged correction.
    #[must_use]
    pub const fn velocity_addition(&self) -> &Vector3<f64> {
        &self.velocity_addition
    }

    /// Reset the correction accumulator.
    pub fn clear_velocity_addition(&mut self) {
        self.velocity_addition = Vector3::zeros();
    }

    /// Add the accumulated correction to the velocity and clear it.
    pub fn apply_velocity_addition(&mut self) {
        self.velocity += self.velocity_addition;
        self.velocity_addition = Vector3::zeros();
    }

    /// Number of clusters containing this vertex.
    #[must_use]
    pub const fn including_cluster_count(&self) -> u32 {
        self.including_cluster_count
    }

    pub(crate) fn set_including_cluster_count(&mut self, count: u32) {
        self.including_cluster_count = count;
    }

    /// Index of the containing cluster whose initial center is closest.
    #[must_use]
    pub const fn nearest_cluster(&self) -> Option<usize> {
        self.nearest_cluster
    }

    /// Record the nearest cluster. Write-once.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvariantViolation`] if already set.
    pub fn set_nearest_cluster(&mut self, cluster: usize) -> Result<()> {
        if let Some(existing) = self.nearest_cluster {
            return Err(DeformableError::invariant_violation(format!(
                "nearest cluster already set to {existing}"
            )));
        }
        self.nearest_cluster = Some(cluster);
        Ok(())
    }

    /// Pin this vertex.
    pub fn pin(&mut self) {
        self.flags.insert(VertexFlags::PINNED);
        self.velocity = Vector3::zeros();
    }

    /// Unpin this vertex.
    pub fn unpin(&mut self) {
        self.flags.remove(VertexFlags::PINNED);
    }

    /// Check if this vertex is pinned.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.flags.contains(VertexFlags::PINNED)
    }

    /// Displacement from the construction position.
    #[must_use]
    pub fn displacement(&self) -> Vector3<f64> {
        self.position - self.initial_position
    }

    /// Linear momentum.
    #[must_use]
    pub fn momentum(&self) -> Vector3<f64> {
        self.velocity * self.mass
    }

    /// Get the kinetic energy of this vertex.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.norm_squared()
    }
}
