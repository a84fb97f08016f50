//! Configuration for clusters and models.
//!
//! [`ClusterConfig`] holds the per-cluster shape-matching coefficients,
//! [`ClusterGrid`] the spatial partition parameters and [`ModelConfig`]
//! everything a [`Model`](crate::Model) needs at construction.
//!
//! `validate()` corrects out-of-range values to the nearest safe value with a
//! warning and only fails on values that cannot be corrected (`NaN`,
//! infinities).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DeformableError, Result};

/// Shape-matching coefficients of a cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterConfig {
    /// Fraction of the distance to the goal position recovered per step.
    /// 0 = no restoring force, 1 = snap to goal in one step.
    pub goal_speed_constant: f64,

    /// Blend of the matched velocities toward the cluster's rigid motion.
    /// 0 = unchanged, 1 = fully rigid.
    pub linear_elasticity: f64,

    /// Strain magnitude `‖S − I‖` above which plastic flow starts.
    pub yield_threshold: f64,

    /// Rate (1/s) at which the rest shape creeps toward the deformed shape.
    /// 0 disables plasticity.
    pub creep_speed: f64,

    /// Upper bound on accumulated plastic deformation `‖P − I‖`.
    pub max_deformation: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::elastic()
    }
}

impl ClusterConfig {
    /// Purely elastic: no plastic flow.
    #[must_use]
    pub const fn elastic() -> Self {
        Self {
            goal_speed_constant: 0.5,
            linear_elasticity: 0.0,
            yield_threshold: 0.1,
            creep_speed: 0.0,
            max_deformation: 0.0,
        }
    }

    /// Soft and bouncy.
    #[must_use]
    pub const fn rubber() -> Self {
        Self {
            goal_speed_constant: 0.3,
            linear_elasticity: 0.0,
            yield_threshold: 0.5,
            creep_speed: 0.0,
            max_deformation: 0.0,
        }
    }

    /// Stiff, dents under large strain.
    #[must_use]
    pub const fn metal() -> Self {
        Self {
            goal_speed_constant: 0.8,
            linear_elasticity: 0.2,
            yield_threshold: 0.05,
            creep_speed: 5.0,
            max_deformation: 0.6,
        }
    }

    /// Soft and easily reshaped.
    #[must_use]
    pub const fn clay() -> Self {
        Self {
            goal_speed_constant: 0.2,
            linear_elasticity: 0.0,
            yield_threshold: 0.01,
            creep_speed: 20.0,
            max_deformation: 2.0,
        }
    }

    /// Whether this configuration can accumulate plastic deformation.
    #[must_use]
    pub fn is_plastic(&self) -> bool {
        self.creep_speed > 0.0 && self.max_deformation > 0.0
    }

    /// Correct out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidConfig`] if any value is not finite.
    pub fn validate(mut self) -> Result<Self> {
        for (name, value) in [
            ("goal_speed_constant", self.goal_speed_constant),
            ("linear_elasticity", self.linear_elasticity),
            ("yield_threshold", self.yield_threshold),
            ("creep_speed", self.creep_speed),
            ("max_deformation", self.max_deformation),
        ] {
            if !value.is_finite() {
                return Err(DeformableError::invalid_config(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }

        self.goal_speed_constant = clamp_unit("goal_speed_constant", self.goal_speed_constant);
        self.linear_elasticity = clamp_unit("linear_elasticity", self.linear_elasticity);
        self.yield_threshold = clamp_non_negative("yield_threshold", self.yield_threshold);
        self.creep_speed = clamp_non_negative("creep_speed", self.creep_speed);
        self.max_deformation = clamp_non_negative("max_deformation", self.max_deformation);
        Ok(self)
    }
}

/// Axis-aligned grid used to partition vertices into clusters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterGrid {
    /// Number of cells along x, y and z.
    pub dims: [usize; 3],
    /// Overlap of neighboring cells, as a fraction of the cell size.
    pub padding: f64,
}

impl Default for ClusterGrid {
    fn default() -> Self {
        Self {
            dims: [2, 2, 2],
            padding: 0.25,
        }
    }
}

impl ClusterGrid {
    /// Create a grid with the given cell counts and padding.
    #[must_use]
    pub const fn new(dims: [usize; 3], padding: f64) -> Self {
        Self { dims, padding }
    }

    /// Total number of cells, or `None` if it does not fit in `usize`.
    #[must_use]
    pub fn cell_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    /// Correct out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidConfig`] if the padding is not finite
    /// or the cell count overflows.
    pub fn validate(mut self) -> Result<Self> {
        if !self.padding.is_finite() {
            return Err(DeformableError::invalid_config(format!(
                "padding must be finite, got {}",
                self.padding
            )));
        }
        for (axis, dim) in self.dims.iter_mut().enumerate() {
            if *dim == 0 {
                warn!(axis, "Zero grid dimension, using 1");
                *dim = 1;
            }
        }
        if self.cell_count().is_none() {
            return Err(DeformableError::invalid_config(format!(
                "grid {:?} has more cells than can be counted",
                self.dims
            )));
        }
        self.padding = clamp_non_negative("padding", self.padding);
        Ok(self)
    }
}

/// Configuration of a deformable model.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelConfig {
    /// Coefficients shared by every cluster.
    pub cluster: ClusterConfig,

    /// Spatial partition.
    pub grid: ClusterGrid,

    /// Velocity damping per step.
    /// 0 = no damping, 1 = full damping.
    pub damping: f64,

    /// Maximum vertex speed.
    /// Set to `f64::INFINITY` to disable.
    pub max_velocity: f64,

    /// Blend of all vertex velocities toward the whole body's rigid motion,
    /// applied every step. 0 disables it.
    pub rigidity: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            grid: ClusterGrid::default(),
            damping: 0.0,
            max_velocity: 100.0,
            rigidity: 0.0,
        }
    }
}

impl ModelConfig {
    /// Set the cluster coefficients.
    #[must_use]
    pub const fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Set the spatial partition.
    #[must_use]
    pub const fn with_grid(mut self, dims: [usize; 3], padding: f64) -> Self {
        self.grid = ClusterGrid::new(dims, padding);
        self
    }

    /// Set the damping.
    #[must_use]
    pub const fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the velocity clamp.
    #[must_use]
    pub const fn with_max_velocity(mut self, max_velocity: f64) -> Self {
        self.max_velocity = max_velocity;
        self
    }

    /// Set the whole-body rigidity.
    #[must_use]
    pub const fn with_rigidity(mut self, rigidity: f64) -> Self {
        self.rigidity = rigidity;
        self
    }

    /// Correct out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidConfig`] for values that are `NaN`
    /// or, except for `max_velocity`, infinite.
    pub fn validate(mut self) -> Result<Self> {
        self.cluster = self.cluster.validate()?;
        self.grid = self.grid.validate()?;

        if !self.damping.is_finite() || !self.rigidity.is_finite() {
            return Err(DeformableError::invalid_config(
                "damping and rigidity must be finite",
            ));
        }
        if self.max_velocity.is_nan() {
            return Err(DeformableError::invalid_config("max_velocity is NaN"));
        }

        self.damping = clamp_unit("damping", self.damping);
        self.rigidity = clamp_unit("rigidity", self.rigidity);
        self.max_velocity = clamp_non_negative("max_velocity", self.max_velocity);
        Ok(self)
    }
}

fn clamp_unit(field: &str, value: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        return value;
    }
    let clamped = value.clamp(0.0, 1.0);
    warn!(field, value, clamped, "Coefficient out of [0, 1], clamped");
    clamped
}

fn clamp_non_negative(field: &str, value: f64) -> f64 {
    if value < 0.0 {
        warn!(field, value, "Negative value, using 0");
        0.0
    } else {
        value
    }
}
