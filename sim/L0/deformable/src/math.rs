//! Linear-algebra glue on top of nalgebra.
//!
//! nalgebra provides vectors, matrices, determinants and inverses. This
//! module adds the few operations shape matching needs by name: the polar
//! decomposition, outer products and volume normalization.

use nalgebra::{Matrix3, Vector3};

use crate::error::{DeformableError, Result};

/// Determinants with a smaller magnitude are treated as zero.
pub const DETERMINANT_EPSILON: f64 = 1e-10;

const SVD_MAX_ITERATIONS: usize = 100;

/// Result of factoring `A = R·S`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarDecomposition {
    /// Proper rotation (`det = +1`).
    pub rotation: Matrix3<f64>,
    /// Symmetric stretch.
    pub scale: Matrix3<f64>,
}

/// Factor `m` into a rotation and a symmetric stretch.
///
/// Computed from the SVD `m = UΣVᵀ` as `R = UVᵀ`, `S = VΣVᵀ`. When `UVᵀ` is a
/// reflection, the column of `U` for the smallest singular value is flipped
/// together with that singular value, so `R` stays a proper rotation and
/// `R·S` still reproduces `m`.
///
/// # Errors
///
/// Returns [`DeformableError::NumericalError`] if `m` is not finite or the SVD
/// does not converge.
pub fn polar_decomposition(m: &Matrix3<f64>) -> Result<PolarDecomposition> {
    if !is_finite_matrix(m) {
        return Err(DeformableError::numerical_error(
            "polar decomposition of a non-finite matrix",
        ));
    }

    let svd = m
        .try_svd(true, true, f64::EPSILON, SVD_MAX_ITERATIONS)
        .ok_or_else(|| DeformableError::numerical_error("SVD did not converge"))?;
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(DeformableError::numerical_error("SVD returned no basis"));
    };
    let mut sigma = svd.singular_values;

    if (u * v_t).determinant() < 0.0 {
        let smallest = sigma.imin();
        u.column_mut(smallest).neg_mut();
        sigma[smallest] = -sigma[smallest];
    }

    let rotation = u * v_t;
    let scale = v_t.transpose() * Matrix3::from_diagonal(&sigma) * v_t;
    Ok(PolarDecomposition { rotation, scale })
}

/// Outer product `a·bᵀ`.
#[must_use]
pub fn outer(a: &Vector3<f64>, b: &Vector3<f64>) -> Matrix3<f64> {
    a * b.transpose()
}

/// Real cube root that keeps the sign of `x`.
#[must_use]
pub fn cube_root_signed(x: f64) -> f64 {
    x.cbrt()
}

/// Frobenius norm of `S − I`.
#[must_use]
pub fn strain_magnitude(scale: &Matrix3<f64>) -> f64 {
    (scale - Matrix3::identity()).norm()
}

/// Check that every element is finite.
#[must_use]
pub fn is_finite_matrix(m: &Matrix3<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// Outcome of [`normalize_volume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeNormalization {
    /// Positive determinant, scaled to unit volume.
    Normalized(Matrix3<f64>),
    /// Negative determinant: the transformation is inside out. Scaled by the
    /// signed cube root, which yields a positive unit determinant.
    Inverted(Matrix3<f64>),
    /// Determinant too close to zero; returned unchanged.
    Degenerate(Matrix3<f64>),
}

impl VolumeNormalization {
    /// The resulting matrix.
    #[must_use]
    pub const fn matrix(&self) -> &Matrix3<f64> {
        match self {
            Self::Normalized(m) | Self::Inverted(m) | Self::Degenerate(m) => m,
        }
    }
}

/// Divide `m` by the cube root of its determinant.
#[must_use]
pub fn normalize_volume(m: &Matrix3<f64>) -> VolumeNormalization {
    let det = m.determinant();
    if !det.is_finite() || det.abs() < DETERMINANT_EPSILON {
        return VolumeNormalization::Degenerate(*m);
    }
    let normalized = m / cube_root_signed(det);
    if det < 0.0 {
        VolumeNormalization::Inverted(normalized)
    } else {
        VolumeNormalization::Normalized(normalized)
    }
}
