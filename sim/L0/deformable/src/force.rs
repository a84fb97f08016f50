//! External forces supplied to [`Model::compute_next_step`](crate::Model::compute_next_step).
//!
//! Forces are a closed set of variants. Each has a magnitude, a predicate
//! telling whether it acts on a point, and a value at a point given the
//! point's velocity.

use nalgebra::{Point3, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An external force field.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Force {
    /// Constant force on every point within `radius` of `point`.
    Point {
        /// Force vector (N).
        value: Vector3<f64>,
        /// Center of influence.
        point: Point3<f64>,
        /// Radius of influence.
        radius: f64,
    },

    /// Constant force on every point on the positive side of a plane,
    /// up to `max_distance` away from it.
    Plane {
        /// Force vector (N).
        value: Vector3<f64>,
        /// Point on the plane.
        point: Point3<f64>,
        /// Unit plane normal.
        normal: Vector3<f64>,
        /// Reach beyond the plane. `f64::INFINITY` for a half-space.
        max_distance: f64,
    },

    /// Damped spring pushing points out of the negative side of a plane.
    HalfSpaceSpring {
        /// Spring constant (N/m).
        spring_constant: f64,
        /// Damping of the normal velocity (N·s/m).
        damping: f64,
        /// Point on the plane.
        point: Point3<f64>,
        /// Unit normal pointing out of the solid side.
        normal: Vector3<f64>,
    },

    /// Damped spring pushing points out of a capped cylinder.
    CylinderSpring {
        /// Spring constant (N/m).
        spring_constant: f64,
        /// Damping of the radial velocity (N·s/m).
        damping: f64,
        /// First axis endpoint.
        start: Point3<f64>,
        /// Second axis endpoint.
        end: Point3<f64>,
        /// Cylinder radius.
        radius: f64,
    },
}

impl Force {
    /// Uniform force everywhere, e.g. gravity times mass.
    #[must_use]
    pub fn uniform(value: Vector3<f64>) -> Self {
        Self::Point {
            value,
            point: Point3::origin(),
            radius: f64::INFINITY,
        }
    }

    /// Force acting near a point.
    #[must_use]
    pub fn point(value: Vector3<f64>, point: Point3<f64>, radius: f64) -> Self {
        Self::Point {
            value,
            point,
            radius: non_negative("radius", radius),
        }
    }

    /// Force acting on the positive side of a plane.
    #[must_use]
    pub fn plane(
        value: Vector3<f64>,
        point: Point3<f64>,
        normal: Vector3<f64>,
        max_distance: f64,
    ) -> Self {
        Self::Plane {
            value,
            point,
            normal: unit_normal(normal),
            max_distance: non_negative("max_distance", max_distance),
        }
    }

    /// Spring floor or wall.
    #[must_use]
    pub fn half_space_spring(
        spring_constant: f64,
        damping: f64,
        point: Point3<f64>,
        normal: Vector3<f64>,
    ) -> Self {
        Self::HalfSpaceSpring {
            spring_constant: non_negative("spring_constant", spring_constant),
            damping: non_negative("damping", damping),
            point,
            normal: unit_normal(normal),
        }
    }

    /// Spring cylinder obstacle.
    #[must_use]
    pub fn cylinder_spring(
        spring_constant: f64,
        damping: f64,
        start: Point3<f64>,
        end: Point3<f64>,
        radius: f64,
    ) -> Self {
        Self::CylinderSpring {
            spring_constant: non_negative("spring_constant", spring_constant),
            damping: non_negative("damping", damping),
            start,
            end,
            radius: non_negative("radius", radius),
        }
    }

    /// Strength of the force: the vector's length for constant forces, the
    /// spring constant for springs.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        match self {
            Self::Point { value, .. } | Self::Plane { value, .. } => value.norm(),
            Self::HalfSpaceSpring {
                spring_constant, ..
            }
            | Self::CylinderSpring {
                spring_constant, ..
            } => *spring_constant,
        }
    }

    /// Check if the force acts on a point.
    #[must_use]
    pub fn is_applied_to(&self, point: &Point3<f64>) -> bool {
        match self {
            Self::Point {
                point: center,
                radius,
                ..
            } => radius.is_infinite() || (point - center).norm() <= *radius,
            Self::Plane {
                point: origin,
                normal,
                max_distance,
                ..
            } => {
                let d = (point - origin).dot(normal);
                d >= 0.0 && d <= *max_distance
            }
            Self::HalfSpaceSpring {
                point: origin,
                normal,
                ..
            } => (point - origin).dot(normal) < 0.0,
            Self::CylinderSpring {
                start, end, radius, ..
            } => cylinder_penetration(point, start, end, *radius).is_some(),
        }
    }

    /// Force at a point moving with `velocity`. Zero where the force does not
    /// act.
    #[must_use]
    pub fn value_at(&self, point: &Point3<f64>, velocity: &Vector3<f64>) -> Vector3<f64> {
        if !self.is_applied_to(point) {
            return Vector3::zeros();
        }
        match self {
            Self::Point { value, .. } | Self::Plane { value, .. } => *value,
            Self::HalfSpaceSpring {
                spring_constant,
                damping,
                point: origin,
                normal,
            } => {
                let depth = -(point - origin).dot(normal);
                spring_response(*spring_constant, *damping, depth, normal, velocity)
            }
            Self::CylinderSpring {
                spring_constant,
                damping,
                start,
                end,
                radius,
            } => match cylinder_penetration(point, start, end, *radius) {
                Some((depth, direction)) => {
                    spring_response(*spring_constant, *damping, depth, &direction, velocity)
                }
                None => Vector3::zeros(),
            },
        }
    }
}

fn spring_response(
    spring_constant: f64,
    damping: f64,
    depth: f64,
    direction: &Vector3<f64>,
    velocity: &Vector3<f64>,
) -> Vector3<f64> {
    let normal_speed = velocity.dot(direction);
    // Damping only resists further penetration.
    let damping_term = if normal_speed < 0.0 {
        -damping * normal_speed
    } else {
        0.0
    };
    direction * (spring_constant * depth + damping_term)
}

/// Penetration depth and outward radial direction for a point inside a
/// capped cylinder.
fn cylinder_penetration(
    point: &Point3<f64>,
    start: &Point3<f64>,
    end: &Point3<f64>,
    radius: f64,
) -> Option<(f64, Vector3<f64>)> {
    let axis = end - start;
    let len_sq = axis.norm_squared();
    if len_sq <= f64::EPSILON {
        return None;
    }
    let rel = point - start;
    let t = rel.dot(&axis) / len_sq;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let radial = rel - axis * t;
    let distance = radial.norm();
    if distance >= radius {
        return None;
    }
    let direction = if distance > f64::EPSILON {
        radial / distance
    } else {
        any_perpendicular(&axis)
    };
    Some((radius - distance, direction))
}

fn any_perpendicular(v: &Vector3<f64>) -> Vector3<f64> {
    let candidate = if v.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    v.cross(&candidate).normalize()
}

fn unit_normal(normal: Vector3<f64>) -> Vector3<f64> {
    normal.try_normalize(f64::EPSILON).unwrap_or_else(|| {
        warn!("Zero force normal, using +Z");
        Vector3::z()
    })
}

fn non_negative(field: &str, value: f64) -> f64 {
    if value < 0.0 {
        warn!(field, value, "Negative force parameter, using 0");
        0.0
    } else {
        value
    }
}
