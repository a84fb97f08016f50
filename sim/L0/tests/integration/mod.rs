//! Integration tests for the deformation engine.
//!
//! These tests drive `sim-deformable` models through the `sim-tasks`
//! scheduler end to end:
//! - Worker pool stepping vs. the inline single-thread schedule
//! - Reactions observed while workers run the cluster phase
//! - Vertex buffer input and output through custom layouts
//! - Worker termination on task failure and deadlock

pub mod common;
pub mod pooled_step;
pub mod reactions;
pub mod vertex_buffer;
pub mod worker_faults;
