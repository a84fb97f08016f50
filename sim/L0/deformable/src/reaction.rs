//! Reactions: predicates over simulation state that fire user callbacks.
//!
//! Every reaction watches a list of vertices, holds a threshold and an enable
//! flag, and fires its callback at most once per invocation. Disabled
//! reactions are skipped without scanning anything.
//!
//! | Reaction | Fires when | Reports |
//! |----------|------------|---------|
//! | [`ShapeDeformationReaction`] | a vertex deforms more than the threshold | the worst offender |
//! | [`RegionReaction`] | a vertex is inside (or outside) a region | the lowest such index |
//! | [`HitReaction`] | a hit faster than the threshold touches a vertex | the lowest hit index |
//! | [`StretchReaction`] | two vertices are farther apart than the threshold | the pair |

use std::fmt;

use hashbrown::HashSet;
use nalgebra::{Point3, Vector3};
use tracing::warn;

use crate::error::{DeformableError, Result};
use crate::region::Region;

/// Callback invoked with the event of a firing reaction.
pub type Callback<E> = Box<dyn FnMut(&E) + Send>;

/// A watched vertex deformed beyond the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeDeformationEvent {
    /// Vertex with the largest deformation.
    pub vertex: usize,
    /// Its deformation distance.
    pub distance: f64,
}

/// A watched vertex matched the region condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionEvent {
    /// First matching vertex in index order.
    pub vertex: usize,
    /// Position of that vertex.
    pub position: Point3<f64>,
}

/// A hit touched a watched vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitEvent {
    /// First hit vertex in index order.
    pub vertex: usize,
    /// Speed of the hit.
    pub speed: f64,
}

/// Two vertices moved too far apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchEvent {
    /// The watched pair.
    pub vertices: [usize; 2],
    /// Their distance.
    pub distance: f64,
}

fn watched(mut vertices: Vec<usize>) -> Vec<usize> {
    vertices.sort_unstable();
    vertices.dedup();
    vertices
}

fn non_negative_threshold(threshold: f64) -> f64 {
    if threshold < 0.0 || threshold.is_nan() {
        warn!(threshold, "Invalid reaction threshold, using 0");
        0.0
    } else {
        threshold
    }
}

/// Fires on the vertex deformed the most, if beyond the threshold.
pub struct ShapeDeformationReaction {
    vertices: Vec<usize>,
    threshold: f64,
    enabled: bool,
    callback: Callback<ShapeDeformationEvent>,
}

impl ShapeDeformationReaction {
    /// Watch `vertices` for deformation beyond `threshold`.
    pub fn new(
        vertices: Vec<usize>,
        threshold: f64,
        callback: impl FnMut(&ShapeDeformationEvent) + Send + 'static,
    ) -> Self {
        Self {
            vertices: watched(vertices),
            threshold: non_negative_threshold(threshold),
            enabled: true,
            callback: Box::new(callback),
        }
    }

    /// Watched vertices, sorted.
    #[must_use]
    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    /// Deformation threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Check if the reaction is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the reaction.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Fire on the worst offender if its deformation exceeds the threshold.
    pub fn invoke_if_needed(
        &mut self,
        deformation: impl Fn(usize) -> f64,
    ) -> Option<ShapeDeformationEvent> {
        if !self.enabled {
            return None;
        }
        let (vertex, distance) = self
            .vertices
            .iter()
            .map(|&v| (v, deformation(v)))
            .fold(None, |worst: Option<(usize, f64)>, (v, d)| match worst {
                Some((_, w)) if w >= d => worst,
                _ => Some((v, d)),
            })?;
        if distance <= self.threshold {
            return None;
        }
        let event = ShapeDeformationEvent { vertex, distance };
        (self.callback)(&event);
        Some(event)
    }
}

impl fmt::Debug for ShapeDeformationReaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeDeformationReaction")
            .field("vertices", &self.vertices)
            .field("threshold", &self.threshold)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Fires on the first watched vertex whose containment in a region matches
/// `on_entering`.
pub struct RegionReaction {
    region: Region,
    vertices: Vec<usize>,
    on_entering: bool,
    enabled: bool,
    callback: Callback<RegionEvent>,
}

impl RegionReaction {
    /// Watch `vertices` against `region`. With `on_entering` the reaction
    /// fires for a vertex inside the region, otherwise for one outside.
    pub fn new(
        region: Region,
        vertices: Vec<usize>,
        on_entering: bool,
        callback: impl FnMut(&RegionEvent) + Send + 'static,
    ) -> Self {
        Self {
            region,
            vertices: watched(vertices),
            on_entering,
            enabled: true,
            callback: Box::new(callback),
        }
    }

    /// Watched region.
    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    /// Move the watched region.
    pub fn translate_region(&mut self, delta: &Vector3<f64>) {
        self.region.translate(delta);
    }

    /// Watched vertices, sorted.
    #[must_use]
    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    /// Whether the reaction fires on vertices inside the region.
    #[must_use]
    pub const fn on_entering(&self) -> bool {
        self.on_entering
    }

    /// Check if the reaction is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the reaction.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Fire on the first vertex, in index order, matching the condition.
    pub fn invoke_if_needed(
        &mut self,
        position: impl Fn(usize) -> Option<Point3<f64>>,
    ) -> Option<RegionEvent> {
        if !self.enabled {
            return None;
        }
        let event = self.vertices.iter().find_map(|&vertex| {
            let p = position(vertex)?;
            (self.region.contains(&p) == self.on_entering).then_some(RegionEvent {
                vertex,
                position: p,
            })
        })?;
        (self.callback)(&event);
        Some(event)
    }
}

impl fmt::Debug for RegionReaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionReaction")
            .field("region", &self.region)
            .field("vertices", &self.vertices)
            .field("on_entering", &self.on_entering)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Fires when a hit faster than the threshold touches a watched vertex.
pub struct HitReaction {
    vertices: Vec<usize>,
    velocity_threshold: f64,
    enabled: bool,
    callback: Callback<HitEvent>,
}

impl HitReaction {
    /// Watch `vertices` for hits faster than `velocity_threshold`.
    pub fn new(
        vertices: Vec<usize>,
        velocity_threshold: f64,
        callback: impl FnMut(&HitEvent) + Send + 'static,
    ) -> Self {
        Self {
            vertices: watched(vertices),
            velocity_threshold: non_negative_threshold(velocity_threshold),
            enabled: true,
            callback: Box::new(callback),
        }
    }

    /// Watched vertices, sorted.
    #[must_use]
    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    /// Speed threshold.
    #[must_use]
    pub const fn velocity_threshold(&self) -> f64 {
        self.velocity_threshold
    }

    /// Check if the reaction is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the reaction.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Fire if the hit is fast enough and touches a watched vertex.
    pub fn invoke_if_needed(
        &mut self,
        hit: &HashSet<usize>,
        velocity: &Vector3<f64>,
    ) -> Option<HitEvent> {
        if !self.enabled {
            return None;
        }
        let speed = velocity.norm();
        if speed <= self.velocity_threshold {
            return None;
        }
        let vertex = *self.vertices.iter().find(|v| hit.contains(*v))?;
        let event = HitEvent { vertex, speed };
        (self.callback)(&event);
        Some(event)
    }
}

impl fmt::Debug for HitReaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HitReaction")
            .field("vertices", &self.vertices)
            .field("velocity_threshold", &self.velocity_threshold)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Fires when two vertices are farther apart than the threshold.
pub struct StretchReaction {
    vertices: [usize; 2],
    threshold: f64,
    enabled: bool,
    callback: Callback<StretchEvent>,
}

impl StretchReaction {
    /// Watch the distance between two vertices.
    pub fn new(
        vertices: [usize; 2],
        threshold: f64,
        callback: impl FnMut(&StretchEvent) + Send + 'static,
    ) -> Self {
        Self {
            vertices,
            threshold: non_negative_threshold(threshold),
            enabled: true,
            callback: Box::new(callback),
        }
    }

    /// The watched pair.
    #[must_use]
    pub const fn vertices(&self) -> &[usize; 2] {
        &self.vertices
    }

    /// Distance threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Check if the reaction is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the reaction.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Fire if the pair is farther apart than the threshold.
    pub fn invoke_if_needed(
        &mut self,
        position: impl Fn(usize) -> Option<Point3<f64>>,
    ) -> Option<StretchEvent> {
        if !self.enabled {
            return None;
        }
        let [a, b] = self.vertices;
        let distance = (position(a)? - position(b)?).norm();
        if distance <= self.threshold {
            return None;
        }
        let event = StretchEvent {
            vertices: self.vertices,
            distance,
        };
        (self.callback)(&event);
        Some(event)
    }
}

impl fmt::Debug for StretchReaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StretchReaction")
            .field("vertices", &self.vertices)
            .field("threshold", &self.threshold)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Handle of a registered reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionId {
    /// A [`ShapeDeformationReaction`].
    ShapeDeformation(usize),
    /// A [`RegionReaction`].
    Region(usize),
    /// A [`HitReaction`].
    Hit(usize),
    /// A [`StretchReaction`].
    Stretch(usize),
}

/// All reactions registered with a model.
#[derive(Debug, Default)]
pub struct Reactions {
    shape_deformation: Vec<ShapeDeformationReaction>,
    region: Vec<RegionReaction>,
    hit: Vec<HitReaction>,
    stretch: Vec<StretchReaction>,
}

impl Reactions {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of registered reactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape_deformation.len() + self.region.len() + self.hit.len() + self.stretch.len()
    }

    /// Check if no reaction is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a shape deformation reaction.
    pub fn add_shape_deformation(&mut self, reaction: ShapeDeformationReaction) -> ReactionId {
        self.shape_deformation.push(reaction);
        ReactionId::ShapeDeformation(self.shape_deformation.len() - 1)
    }

    /// Register a region reaction.
    pub fn add_region(&mut self, reaction: RegionReaction) -> ReactionId {
        self.region.push(reaction);
        ReactionId::Region(self.region.len() - 1)
    }

    /// Register a hit reaction.
    pub fn add_hit(&mut self, reaction: HitReaction) -> ReactionId {
        self.hit.push(reaction);
        ReactionId::Hit(self.hit.len() - 1)
    }

    /// Register a stretch reaction.
    pub fn add_stretch(&mut self, reaction: StretchReaction) -> ReactionId {
        self.stretch.push(reaction);
        ReactionId::Stretch(self.stretch.len() - 1)
    }

    /// Enable or disable a reaction.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown id.
    pub fn set_enabled(&mut self, id: ReactionId, enabled: bool) -> Result<()> {
        let slot = match id {
            ReactionId::ShapeDeformation(i) => self
                .shape_deformation
                .get_mut(i)
                .map(|r| r.set_enabled(enabled)),
            ReactionId::Region(i) => self.region.get_mut(i).map(|r| r.set_enabled(enabled)),
            ReactionId::Hit(i) => self.hit.get_mut(i).map(|r| r.set_enabled(enabled)),
            ReactionId::Stretch(i) => self.stretch.get_mut(i).map(|r| r.set_enabled(enabled)),
        };
        slot.ok_or_else(|| {
            DeformableError::index_out_of_bounds(format!("unknown reaction {id:?}"))
        })
    }

    /// Check if a reaction is enabled. `None` for an unknown id.
    #[must_use]
    pub fn is_enabled(&self, id: ReactionId) -> Option<bool> {
        match id {
            ReactionId::ShapeDeformation(i) => self.shape_deformation.get(i).map(|r| r.enabled),
            ReactionId::Region(i) => self.region.get(i).map(|r| r.enabled),
            ReactionId::Hit(i) => self.hit.get(i).map(|r| r.enabled),
            ReactionId::Stretch(i) => self.stretch.get(i).map(|r| r.enabled),
        }
    }

    /// Mutable access to a region reaction, e.g. to move its region.
    pub fn region_mut(&mut self, index: usize) -> Option<&mut RegionReaction> {
        self.region.get_mut(index)
    }

    /// Run the position-based reactions. Returns the number that fired.
    pub fn invoke_after_step(
        &mut self,
        position: impl Fn(usize) -> Option<Point3<f64>> + Copy,
        deformation: impl Fn(usize) -> f64 + Copy,
    ) -> usize {
        let mut fired = 0;
        for reaction in &mut self.shape_deformation {
            fired += usize::from(reaction.invoke_if_needed(deformation).is_some());
        }
        for reaction in &mut self.region {
            fired += usize::from(reaction.invoke_if_needed(position).is_some());
        }
        for reaction in &mut self.stretch {
            fired += usize::from(reaction.invoke_if_needed(position).is_some());
        }
        fired
    }

    /// Run the hit reactions. Returns the number that fired.
    pub fn invoke_hit(&mut self, hit: &HashSet<usize>, velocity: &Vector3<f64>) -> usize {
        self.hit
            .iter_mut()
            .filter_map(|r| r.invoke_if_needed(hit, velocity))
            .count()
    }
}
