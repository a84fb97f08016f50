//! Error types for shape-matching deformation.

use sim_tasks::TaskError;
use thiserror::Error;

/// Errors that can occur while building or stepping a deformable model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeformableError {
    /// Invalid configuration value that could not be corrected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Vertex layout does not fit the vertex buffer.
    #[error("Invalid vertex layout: {0}")]
    InvalidLayout(String),

    /// Index out of bounds.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Non-positive mass where a mass-weighted computation needs a positive one.
    #[error("Invalid mass: {0}")]
    InvalidMass(String),

    /// Numeric degeneracy (singular inertia tensor, zero-extent cluster).
    #[error("Degenerate geometry: {0}")]
    Degenerate(String),

    /// Internal bookkeeping invariant was violated.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Numerical error (`NaN`, infinity, non-converging decomposition).
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Failure in the task substrate.
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl DeformableError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid layout error.
    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        Self::InvalidLayout(msg.into())
    }

    /// Create an index out of bounds error.
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Self::IndexOutOfBounds(msg.into())
    }

    /// Create an invalid mass error.
    pub fn invalid_mass(msg: impl Into<String>) -> Self {
        Self::InvalidMass(msg.into())
    }

    /// Create a degenerate geometry error.
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::Degenerate(msg.into())
    }

    /// Create an invariant violation error.
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical_error(msg: impl Into<String>) -> Self {
        Self::NumericalError(msg.into())
    }

    /// Check if this is a numeric degeneracy the simulation can step past.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::Degenerate(_))
    }

    /// Check if this is an internal invariant violation.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Result type for deformable model operations.
pub type Result<T> = std::result::Result<T, DeformableError>;
