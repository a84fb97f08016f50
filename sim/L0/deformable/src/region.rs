//! Geometric regions used by reactions, hits and repairs.
//!
//! A [`Region`] is a pure predicate over points. The only mutation is
//! [`Region::translate`], which moves the region in place.

use nalgebra::{Point3, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A closed geometric region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Region {
    /// Contains nothing.
    #[default]
    Empty,

    /// Ball around a center.
    Sphere {
        /// Center point.
        center: Point3<f64>,
        /// Radius (non-negative).
        radius: f64,
    },

    /// Capped cylinder between two axis points.
    Cylinder {
        /// First axis endpoint.
        start: Point3<f64>,
        /// Second axis endpoint.
        end: Point3<f64>,
        /// Radius (non-negative).
        radius: f64,
    },

    /// Axis-aligned box.
    Box {
        /// Minimum corner.
        min: Point3<f64>,
        /// Maximum corner.
        max: Point3<f64>,
    },
}

impl Region {
    /// Create a spherical region. A negative radius is corrected to 0.
    #[must_use]
    pub fn sphere(center: Point3<f64>, radius: f64) -> Self {
        Self::Sphere {
            center,
            radius: non_negative_radius(radius),
        }
    }

    /// Create a cylindrical region. A negative radius is corrected to 0.
    #[must_use]
    pub fn cylinder(start: Point3<f64>, end: Point3<f64>, radius: f64) -> Self {
        Self::Cylinder {
            start,
            end,
            radius: non_negative_radius(radius),
        }
    }

    /// Create a box from any two opposite corners.
    #[must_use]
    pub fn aabb(a: Point3<f64>, b: Point3<f64>) -> Self {
        Self::Box {
            min: a.inf(&b),
            max: a.sup(&b),
        }
    }

    /// Check if a point lies inside the region (boundary included).
    #[must_use]
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        match self {
            Self::Empty => false,
            Self::Sphere { center, radius } => (point - center).norm_squared() <= radius * radius,
            Self::Cylinder { start, end, radius } => {
                let axis = end - start;
                let rel = point - start;
                let len_sq = axis.norm_squared();
                if len_sq <= f64::EPSILON {
                    return rel.norm_squared() <= radius * radius;
                }
                let t = rel.dot(&axis) / len_sq;
                if !(0.0..=1.0).contains(&t) {
                    return false;
                }
                (rel - axis * t).norm_squared() <= radius * radius
            }
            Self::Box { min, max } => (0..3).all(|i| point[i] >= min[i] && point[i] <= max[i]),
        }
    }

    /// Translate the region by `delta`.
    pub fn translate(&mut self, delta: &Vector3<f64>) {
        match self {
            Self::Empty => {}
            Self::Sphere { center, .. } => *center += *delta,
            Self::Cylinder { start, end, .. } => {
                *start += *delta;
                *end += *delta;
            }
            Self::Box { min, max } => {
                *min += *delta;
                *max += *delta;
            }
        }
    }

    /// Translated copy of the region.
    #[must_use]
    pub fn translated(mut self, delta: &Vector3<f64>) -> Self {
        self.translate(delta);
        self
    }

    /// Check if this is the empty region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

fn non_negative_radius(radius: f64) -> f64 {
    if radius < 0.0 {
        warn!(radius, "Negative region radius, using 0");
        0.0
    } else {
        radius
    }
}
