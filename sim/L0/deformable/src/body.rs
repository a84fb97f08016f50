//! Rigid-body kinematics over a set of point masses.
//!
//! A [`Body`] is built on demand from any vertex set (a cluster's members or
//! the whole model). It yields the aggregate center of mass, inertia tensor
//! and rigid [`RigidMotion`], and can blend its members' velocities toward a
//! rigid motion.

use nalgebra::{Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DeformableError, Result};
use crate::math::outer;
use crate::types::Vertex;

/// Inertia tensors whose normalized determinant is below this are singular.
const INERTIA_SINGULARITY_TOLERANCE: f64 = 1e-10;

/// A point mass taking part in a [`Body`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PointMass {
    /// Position in world coordinates.
    pub position: Point3<f64>,
    /// Velocity in world coordinates.
    pub velocity: Vector3<f64>,
    /// Mass in kg.
    pub mass: f64,
}

impl PointMass {
    /// Create a point mass.
    #[must_use]
    pub const fn new(position: Point3<f64>, velocity: Vector3<f64>, mass: f64) -> Self {
        Self {
            position,
            velocity,
            mass,
        }
    }
}

impl From<&Vertex> for PointMass {
    fn from(vertex: &Vertex) -> Self {
        Self::new(vertex.position, vertex.velocity, vertex.mass)
    }
}

/// Rigid motion: a linear velocity plus an angular velocity about a center.
///
/// # Example
///
/// ```
/// use nalgebra::{Point3, Vector3};
/// use sim_deformable::RigidMotion;
///
/// let motion = RigidMotion::new(Point3::origin(), Vector3::zeros(), Vector3::z());
/// let v = motion.velocity_at(&Point3::new(1.0, 0.0, 0.0));
/// assert!((v.y - 1.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RigidMotion {
    /// Point the angular velocity is taken about.
    pub center_of_mass: Point3<f64>,
    /// Linear velocity (m/s).
    pub linear: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub angular: Vector3<f64>,
}

impl RigidMotion {
    /// Create a rigid motion.
    #[must_use]
    pub const fn new(
        center_of_mass: Point3<f64>,
        linear: Vector3<f64>,
        angular: Vector3<f64>,
    ) -> Self {
        Self {
            center_of_mass,
            linear,
            angular,
        }
    }

    /// Motion at rest about the origin.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(Point3::origin(), Vector3::zeros(), Vector3::zeros())
    }

    /// Velocity of a rigidly attached point.
    #[must_use]
    pub fn velocity_at(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(&(point - self.center_of_mass))
    }
}

/// Aggregate mass distribution of a [`Body`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Sum of member masses.
    pub total_mass: f64,
    /// Mass-weighted mean position.
    pub center_of_mass: Point3<f64>,
    /// Inertia tensor about the center of mass.
    pub inertia_tensor: Matrix3<f64>,
}

/// A set of point masses treated as one rigid body.
#[derive(Debug, Clone, Default)]
pub struct Body {
    points: Vec<PointMass>,
    properties: Option<MassProperties>,
}

impl Body {
    /// Create a body from point masses.
    #[must_use]
    pub fn new(points: Vec<PointMass>) -> Self {
        Self {
            points,
            properties: None,
        }
    }

    /// Create a body from a subset of vertices.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an invalid index.
    pub fn from_vertices(
        vertices: &[Vertex],
        indices: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let points = indices
            .into_iter()
            .map(|i| {
                vertices.get(i).map(PointMass::from).ok_or_else(|| {
                    DeformableError::index_out_of_bounds(format!(
                        "vertex {i} of {}",
                        vertices.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(points))
    }

    /// Member point masses.
    #[must_use]
    pub fn points(&self) -> &[PointMass] {
        &self.points
    }

    /// Consume the body, returning its point masses.
    #[must_use]
    pub fn into_points(self) -> Vec<PointMass> {
        self.points
    }

    /// Properties from the last [`compute_properties`](Self::compute_properties).
    #[must_use]
    pub const fn properties(&self) -> Option<&MassProperties> {
        self.properties.as_ref()
    }

    /// Compute the center of mass and the inertia tensor
    /// `I = Σ mᵢ (|rᵢ|²·Id − rᵢ·rᵢᵀ)`.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::Degenerate`] for an empty body and
    /// [`DeformableError::InvalidMass`] for a non-positive member mass.
    pub fn compute_properties(&mut self) -> Result<MassProperties> {
        if self.points.is_empty() {
            return Err(DeformableError::degenerate("body has no points"));
        }

        let mut total_mass = 0.0;
        let mut weighted = Vector3::zeros();
        for (i, p) in self.points.iter().enumerate() {
            if p.mass <= 0.0 || !p.mass.is_finite() {
                return Err(DeformableError::invalid_mass(format!(
                    "body point {i} has mass {}",
                    p.mass
                )));
            }
            total_mass += p.mass;
            weighted += p.position.coords * p.mass;
        }
        let center_of_mass = Point3::from(weighted / total_mass);

        let inertia_tensor = self.points.iter().fold(Matrix3::zeros(), |acc, p| {
            let r = p.position - center_of_mass;
            acc + (Matrix3::identity() * r.norm_squared() - outer(&r, &r)) * p.mass
        });

        let properties = MassProperties {
            total_mass,
            center_of_mass,
            inertia_tensor,
        };
        self.properties = Some(properties);
        Ok(properties)
    }

    /// Linear motion only: mass-weighted mean velocity, zero angular velocity.
    ///
    /// # Errors
    ///
    /// Same as [`compute_properties`](Self::compute_properties).
    pub fn linear_motion(&mut self) -> Result<RigidMotion> {
        let props = self.ensure_properties()?;
        let momentum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.velocity * p.mass);
        Ok(RigidMotion::new(
            props.center_of_mass,
            momentum / props.total_mass,
            Vector3::zeros(),
        ))
    }

    /// Compute the rigid motion that best explains the member velocities.
    ///
    /// Linear velocity is the mass-weighted mean velocity; angular velocity
    /// is `I⁻¹ · Σ mᵢ (rᵢ × vᵢ)`.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::Degenerate`] if the inertia tensor is
    /// singular (single point, collinear points), plus the errors of
    /// [`compute_properties`](Self::compute_properties).
    pub fn compute_velocities(&mut self) -> Result<RigidMotion> {
        let mut motion = self.linear_motion()?;
        let props = self.ensure_properties()?;

        let inverse = invert_inertia(&props.inertia_tensor)?;
        let angular_momentum = self.points.iter().fold(Vector3::zeros(), |acc, p| {
            acc + (p.position - props.center_of_mass).cross(&p.velocity) * p.mass
        });
        motion.angular = inverse * angular_momentum;
        Ok(motion)
    }

    /// Rigid motion with angular velocity when the body can resolve one,
    /// otherwise linear motion only.
    ///
    /// # Errors
    ///
    /// Same as [`compute_properties`](Self::compute_properties).
    pub fn fit_rigid_motion(&mut self) -> Result<RigidMotion> {
        match self.compute_velocities() {
            Err(e) if e.is_degenerate() => self.linear_motion(),
            other => other,
        }
    }

    /// Blend every member velocity toward `target`:
    /// `v ← coeff·target.velocity_at(x) + (1 − coeff)·v`.
    ///
    /// `coeff` is clamped to [0, 1].
    pub fn set_rigid_motion(&mut self, target: &RigidMotion, coeff: f64) {
        let coeff = coeff.clamp(0.0, 1.0);
        for p in &mut self.points {
            p.velocity = target.velocity_at(&p.position) * coeff + p.velocity * (1.0 - coeff);
        }
    }

    fn ensure_properties(&mut self) -> Result<MassProperties> {
        match self.properties {
            Some(props) => Ok(props),
            None => self.compute_properties(),
        }
    }
}

fn invert_inertia(inertia: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let scale = inertia.trace() / 3.0;
    if scale <= 0.0 {
        return Err(DeformableError::degenerate("inertia tensor is zero"));
    }
    if inertia.determinant().abs() < INERTIA_SINGULARITY_TOLERANCE * scale.powi(3) {
        return Err(DeformableError::degenerate(
            "inertia tensor is singular (collinear body)",
        ));
    }
    inertia.try_inverse().ok_or_else(|| {
        DeformableError::degenerate("inertia tensor is not invertible")
    })
}
