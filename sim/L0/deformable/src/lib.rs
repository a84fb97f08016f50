//! Real-time shape-matching deformation.
//!
//! A model's vertices are partitioned into overlapping clusters. Every step,
//! each cluster finds the rigid motion plus volume-preserving stretch that
//! best maps its rest shape onto the current vertex positions, and pulls its
//! vertices toward that goal shape. Clusters may yield and creep into a new
//! rest shape (plasticity).
//!
//! # Physics Model
//!
//! ```text
//! For each cluster (in parallel):
//!   1. c   = Σ mᵢ xᵢ / M
//!   2. Apq = Σ mᵢ (xᵢ − c) qᵢᵀ
//!   3. A   = Apq · Aqq⁻¹, scaled to det(A) = 1
//!   4. A   = R · S                      (polar decomposition)
//!   5. if ‖S − I‖ > yield: P ← (I + k(S − I)) P, qᵢ = P qᵢ⁰
//!   6. gᵢ  = c + R qᵢ
//!   7. Δvᵢ = (gᵢ − xᵢ) α / dt
//! Then, on the driver thread:
//!   8. vᵢ += average of Δvᵢ over the clusters containing i
//!   9. vᵢ += Fᵢ / mᵢ · dt,  xᵢ += vᵢ · dt
//!  10. run reactions
//! ```
//!
//! Because clusters overlap, a vertex shared by K clusters receives the
//! average of their corrections. Each cluster writes its corrections to its
//! own buffer; the buffers are folded into the vertices after the task queue
//! barrier, so the parallel phase never writes shared state.
//!
//! # Materials
//!
//! | Preset | α | Yield | Creep | Max deformation |
//! |--------|---|-------|-------|-----------------|
//! | [`ClusterConfig::elastic`] | 0.5 | - | 0 | 0 |
//! | [`ClusterConfig::rubber`] | 0.3 | - | 0 | 0 |
//! | [`ClusterConfig::metal`] | 0.8 | 0.05 | 5 | 0.6 |
//! | [`ClusterConfig::clay`] | 0.2 | 0.01 | 20 | 2.0 |
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use nalgebra::{Point3, Vector3};
//! use sim_deformable::{Force, Masses, Model, ModelConfig};
//! use sim_tasks::SingleThreadPrimFactory;
//!
//! let mut positions = Vec::new();
//! for z in 0..3 {
//!     for y in 0..3 {
//!         for x in 0..3 {
//!             positions.push(Point3::new(f64::from(x), f64::from(y), f64::from(z)));
//!         }
//!     }
//! }
//!
//! let mut model = Model::from_positions(
//!     &positions,
//!     Masses::Constant(1.0),
//!     ModelConfig::default(),
//!     Arc::new(SingleThreadPrimFactory),
//! )
//! .unwrap();
//!
//! let gravity = Force::uniform(Vector3::new(0.0, 0.0, -9.81));
//! let report = model.step(&[gravity], 1.0 / 60.0).unwrap();
//! assert!(report.linear_velocity_change.z < 0.0);
//! ```
//!
//! With worker threads, the driver splits the step:
//! [`Model::prepare_tasks`] returns the queue for the workers,
//! [`Model::wait_for_tasks`] is the barrier, and
//! [`Model::compute_next_step`] integrates.
//!
//! # Layer 0 Crate
//!
//! No rendering or engine dependencies. Vertex data is exchanged with
//! external buffers through [`VertexLayout`].

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod body;
pub mod cluster;
pub mod clustering;
pub mod config;
pub mod error;
pub mod force;
pub mod layout;
pub mod math;
pub mod model;
pub mod reaction;
pub mod region;
mod task;
pub mod types;

pub use body::{Body, MassProperties, PointMass, RigidMotion};
pub use cluster::{Cluster, ClusterMember, ClusterStatus};
pub use clustering::partition;
pub use config::{ClusterConfig, ClusterGrid, ModelConfig};
pub use error::{DeformableError, Result};
pub use force::Force;
pub use layout::{CoordinateTransform, VEC3_SIZE, VertexLayout};
pub use math::{PolarDecomposition, VolumeNormalization, polar_decomposition};
pub use model::{
    DEFAULT_STEP_TIMEOUT, HitReport, Masses, Model, ModelDescriptor, StepReport,
};
pub use reaction::{
    Callback, HitEvent, HitReaction, ReactionId, Reactions, RegionEvent, RegionReaction,
    ShapeDeformationEvent, ShapeDeformationReaction, StretchEvent, StretchReaction,
};
pub use region::Region;
pub use task::ClusterTask;
pub use types::{Vertex, VertexFlags};
