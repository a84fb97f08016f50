//! Static partition of vertices into overlapping clusters.
//!
//! The bounding box of the vertices is split into an axis-aligned grid. Each
//! cell, grown by `padding` cell sizes on every side, becomes a cluster of the
//! vertices inside it, so neighboring clusters share their boundary vertices.
//!
//! The build runs in two passes. The assign pass adds vertices to clusters;
//! the count pass then fixes each vertex's `including_cluster_count` and its
//! nearest cluster before any correction is applied.

use hashbrown::HashMap;
use nalgebra::Point3;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::config::{ClusterConfig, ClusterGrid};
use crate::error::{DeformableError, Result};
use crate::types::Vertex;

/// Grid coordinates of a cell, `[x, y, z]`.
type CellKey = [usize; 3];

/// Cells a vertex belongs to; most vertices touch few cells.
type CellList = SmallVec<[CellKey; 8]>;

/// Clusters that include a vertex.
type ClusterList = SmallVec<[usize; 8]>;

/// Grid geometry over a bounding box.
#[derive(Debug, Clone, Copy)]
struct GridGeometry {
    min: Point3<f64>,
    cell_size: [f64; 3],
    dims: [usize; 3],
    padding: f64,
}

impl GridGeometry {
    fn new(vertices: &[Vertex], grid: &ClusterGrid) -> Self {
        let (min, max) = vertices.iter().fold(
            (
                Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
                Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            ),
            |(lo, hi), v| (lo.inf(&v.position), hi.sup(&v.position)),
        );
        let mut cell_size = [1.0; 3];
        for axis in 0..3 {
            let extent = max[axis] - min[axis];
            #[allow(clippy::cast_precision_loss)]
            let size = extent / grid.dims[axis] as f64;
            if size > 0.0 {
                cell_size[axis] = size;
            }
        }
        Self {
            min,
            cell_size,
            dims: grid.dims,
            padding: grid.padding,
        }
    }

    /// Inclusive range of cell indices along `axis` whose padded extent
    /// contains `coordinate`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn axis_range(&self, axis: usize, coordinate: f64) -> (usize, usize) {
        let t = (coordinate - self.min[axis]) / self.cell_size[axis];
        let last = self.dims[axis] - 1;
        let clamp = |x: f64| (x.floor().max(0.0) as usize).min(last);
        let own = clamp(t);
        let lo = clamp(t - self.padding).min(own);
        let hi = clamp(t + self.padding).max(own);
        (lo, hi)
    }

    fn cells_of(&self, p: &Point3<f64>) -> CellList {
        let (x0, x1) = self.axis_range(0, p.x);
        let (y0, y1) = self.axis_range(1, p.y);
        let (z0, z1) = self.axis_range(2, p.z);
        let mut cells = CellList::new();
        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    cells.push([x, y, z]);
                }
            }
        }
        cells
    }
}

/// Partition `vertices` into frozen clusters and fix each vertex's cluster
/// count and nearest cluster.
///
/// Every vertex ends up in at least one cluster. Empty cells produce no
/// cluster.
///
/// # Errors
///
/// Returns [`DeformableError::InvalidConfig`] for an invalid grid and
/// [`DeformableError::InvalidMass`] for a vertex with non-positive mass.
pub fn partition(
    vertices: &mut [Vertex],
    grid: &ClusterGrid,
    config: &ClusterConfig,
) -> Result<Vec<Cluster>> {
    let grid = grid.validate()?;
    if vertices.is_empty() {
        return Ok(Vec::new());
    }
    for (i, v) in vertices.iter().enumerate() {
        v.check_mass(i)?;
    }

    // Assign pass.
    let geometry = GridGeometry::new(vertices, &grid);
    // Only occupied cells are stored, so the grid may be arbitrarily fine.
    let mut cells: HashMap<CellKey, Cluster> = HashMap::new();
    for (i, v) in vertices.iter().enumerate() {
        for cell in geometry.cells_of(&v.position) {
            cells
                .entry(cell)
                .or_insert_with(|| Cluster::new(*config))
                .add_vertex(i, v.position, v.mass)?;
        }
    }
    let mut occupied: Vec<(CellKey, Cluster)> = cells.into_iter().collect();
    occupied.sort_unstable_by_key(|&([x, y, z], _)| [z, y, x]);
    let mut clusters: Vec<Cluster> = occupied.into_iter().map(|(_, c)| c).collect();
    for cluster in &mut clusters {
        cluster.freeze();
    }

    // Count pass.
    let mut membership: Vec<ClusterList> = vec![ClusterList::new(); vertices.len()];
    for (c, cluster) in clusters.iter().enumerate() {
        for member in cluster.members() {
            membership[member.vertex].push(c);
        }
    }
    for (i, (vertex, including)) in vertices.iter_mut().zip(&membership).enumerate() {
        let count = u32::try_from(including.len()).map_err(|_| {
            DeformableError::invariant_violation(format!("vertex {i} is in too many clusters"))
        })?;
        if count == 0 {
            return Err(DeformableError::invariant_violation(format!(
                "vertex {i} is in no cluster"
            )));
        }
        vertex.set_including_cluster_count(count);

        let nearest = including
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let da = (clusters[a].initial_center_of_mass() - vertex.position).norm_squared();
                let db = (clusters[b].initial_center_of_mass() - vertex.position).norm_squared();
                da.total_cmp(&db)
            })
            .ok_or_else(|| {
                DeformableError::invariant_violation("vertex has no cluster")
            })?;
        vertex.set_nearest_cluster(nearest)?;
    }

    let invalid = clusters.iter().filter(|c| !c.is_valid()).count();
    info!(
        vertices = vertices.len(),
        clusters = clusters.len(),
        invalid,
        dims = ?grid.dims,
        "Partitioned vertices into clusters"
    );
    debug!(
        max_overlap = membership.iter().map(SmallVec::len).max().unwrap_or(0),
        "Cluster overlap"
    );
    Ok(clusters)
}
