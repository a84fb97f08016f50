//! Reading and writing vertices in an externally owned buffer.
//!
//! A [`VertexLayout`] describes where, inside each `stride`-byte record, the
//! position and any extra points or vectors live. Every field is three
//! native-endian `f32`s (12 bytes), the usual GPU vertex format.

use bytemuck::{bytes_of, pod_read_unaligned};
use nalgebra::{Point3, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DeformableError, Result};

/// Size in bytes of one stored 3-component field.
pub const VEC3_SIZE: usize = 3 * size_of::<f32>();

/// Byte layout of one vertex record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VertexLayout {
    stride: usize,
    position_offset: usize,
    point_offsets: Vec<usize>,
    vector_offsets: Vec<usize>,
}

impl VertexLayout {
    /// Layout with only a position field.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] if the position does not
    /// fit in `stride`.
    pub fn new(stride: usize, position_offset: usize) -> Result<Self> {
        let layout = Self {
            stride,
            position_offset,
            point_offsets: Vec::new(),
            vector_offsets: Vec::new(),
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Tightly packed positions.
    #[must_use]
    pub const fn positions_only() -> Self {
        Self {
            stride: VEC3_SIZE,
            position_offset: 0,
            point_offsets: Vec::new(),
            vector_offsets: Vec::new(),
        }
    }

    /// Add an extra point field, carried with the vertex's nearest cluster.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] if the field does not fit.
    pub fn with_point(mut self, offset: usize) -> Result<Self> {
        self.point_offsets.push(offset);
        self.validate()?;
        Ok(self)
    }

    /// Add an extra vector field (e.g. a normal), rotated with the vertex's
    /// nearest cluster.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] if the field does not fit.
    pub fn with_vector(mut self, offset: usize) -> Result<Self> {
        self.vector_offsets.push(offset);
        self.validate()?;
        Ok(self)
    }

    /// Check that every field fits inside one record.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] naming the first field that
    /// does not fit.
    pub fn validate(&self) -> Result<()> {
        if self.stride < VEC3_SIZE {
            return Err(DeformableError::invalid_layout(format!(
                "stride {} is smaller than one field ({VEC3_SIZE} bytes)",
                self.stride
            )));
        }
        let fields = std::iter::once(("position", self.position_offset))
            .chain(self.point_offsets.iter().map(|&o| ("point", o)))
            .chain(self.vector_offsets.iter().map(|&o| ("vector", o)));
        for (name, offset) in fields {
            let end = offset.checked_add(VEC3_SIZE);
            if end.is_none_or(|end| end > self.stride) {
                return Err(DeformableError::invalid_layout(format!(
                    "{name} field at offset {offset} overruns stride {}",
                    self.stride
                )));
            }
        }
        Ok(())
    }

    /// Bytes per vertex record.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Offset of the position field.
    #[must_use]
    pub const fn position_offset(&self) -> usize {
        self.position_offset
    }

    /// Offsets of the extra point fields.
    #[must_use]
    pub fn point_offsets(&self) -> &[usize] {
        &self.point_offsets
    }

    /// Offsets of the extra vector fields.
    #[must_use]
    pub fn vector_offsets(&self) -> &[usize] {
        &self.vector_offsets
    }

    /// Buffer size needed for `count` vertices.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] if the size overflows.
    pub fn required_len(&self, count: usize) -> Result<usize> {
        count.checked_mul(self.stride).ok_or_else(|| {
            DeformableError::invalid_layout(format!(
                "{count} records of {} bytes overflow a buffer size",
                self.stride
            ))
        })
    }

    /// Fail unless `buffer` holds `count` records.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::InvalidLayout`] if the buffer is too short
    /// or its required size overflows.
    pub fn check_buffer(&self, buffer: &[u8], count: usize) -> Result<()> {
        let needed = self.required_len(count)?;
        if buffer.len() < needed {
            return Err(DeformableError::invalid_layout(format!(
                "buffer of {} bytes is too short for {count} vertices ({needed} bytes)",
                buffer.len()
            )));
        }
        Ok(())
    }

    fn field(&self, vertex: usize, offset: usize) -> Result<usize> {
        vertex
            .checked_mul(self.stride)
            .and_then(|base| base.checked_add(offset))
            .ok_or_else(|| {
                DeformableError::index_out_of_bounds(format!(
                    "record {vertex} is beyond any addressable buffer"
                ))
            })
    }

    /// Read the position of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if the record is not in
    /// `buffer`.
    pub fn read_position(&self, buffer: &[u8], vertex: usize) -> Result<Point3<f64>> {
        read_vec3(buffer, self.field(vertex, self.position_offset)?).map(Point3::from)
    }

    /// Write the position of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if the record is not in
    /// `buffer`.
    pub fn write_position(&self, buffer: &mut [u8], vertex: usize, p: &Point3<f64>) -> Result<()> {
        write_vec3(buffer, self.field(vertex, self.position_offset)?, &p.coords)
    }

    /// Read every extra point of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if the record is not in
    /// `buffer`.
    pub fn read_points(&self, buffer: &[u8], vertex: usize) -> Result<Vec<Point3<f64>>> {
        self.point_offsets
            .iter()
            .map(|&o| {
                read_vec3(buffer, self.field(vertex, o)?).map(Point3::from)
            })
            .collect()
    }

    /// Read every extra vector of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] if the record is not in
    /// `buffer`.
    pub fn read_vectors(&self, buffer: &[u8], vertex: usize) -> Result<Vec<Vector3<f64>>> {
        self.vector_offsets
            .iter()
            .map(|&o| read_vec3(buffer, self.field(vertex, o)?))
            .collect()
    }

    /// Write the `index`-th extra point of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown field or
    /// a record not in `buffer`.
    pub fn write_point(
        &self,
        buffer: &mut [u8],
        vertex: usize,
        index: usize,
        p: &Point3<f64>,
    ) -> Result<()> {
        let offset = *self.point_offsets.get(index).ok_or_else(|| {
            DeformableError::index_out_of_bounds(format!("point field {index}"))
        })?;
        write_vec3(buffer, self.field(vertex, offset)?, &p.coords)
    }

    /// Write the `index`-th extra vector of a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DeformableError::IndexOutOfBounds`] for an unknown field or
    /// a record not in `buffer`.
    pub fn write_vector(
        &self,
        buffer: &mut [u8],
        vertex: usize,
        index: usize,
        v: &Vector3<f64>,
    ) -> Result<()> {
        let offset = *self.vector_offsets.get(index).ok_or_else(|| {
            DeformableError::index_out_of_bounds(format!("vector field {index}"))
        })?;
        write_vec3(buffer, self.field(vertex, offset)?, v)
    }
}

/// Read three `f32`s at byte offset `at`.
///
/// # Errors
///
/// Returns [`DeformableError::IndexOutOfBounds`] if the field is not in
/// `buffer`.
pub fn read_vec3(buffer: &[u8], at: usize) -> Result<Vector3<f64>> {
    let bytes = at
        .checked_add(VEC3_SIZE)
        .and_then(|end| buffer.get(at..end))
        .ok_or_else(|| out_of_buffer(at, buffer.len()))?;
    let [x, y, z]: [f32; 3] = pod_read_unaligned(bytes);
    Ok(Vector3::new(f64::from(x), f64::from(y), f64::from(z)))
}

/// Write three `f32`s at byte offset `at`.
///
/// # Errors
///
/// Returns [`DeformableError::IndexOutOfBounds`] if the field is not in
/// `buffer`.
#[allow(clippy::cast_possible_truncation)]
pub fn write_vec3(buffer: &mut [u8], at: usize, v: &Vector3<f64>) -> Result<()> {
    let len = buffer.len();
    let bytes = at
        .checked_add(VEC3_SIZE)
        .and_then(|end| buffer.get_mut(at..end))
        .ok_or_else(|| out_of_buffer(at, len))?;
    let values = [v.x as f32, v.y as f32, v.z as f32];
    bytes.copy_from_slice(bytes_of(&values));
    Ok(())
}

fn out_of_buffer(at: usize, len: usize) -> DeformableError {
    DeformableError::index_out_of_bounds(format!(
        "field at byte {at} is outside a buffer of {len} bytes"
    ))
}

/// Maps simulation-space points to Cartesian output space.
pub trait CoordinateTransform: Send + Sync {
    /// Transform one point.
    fn to_cartesian(&self, point: &Point3<f64>) -> Point3<f64>;
}

impl<F> CoordinateTransform for F
where
    F: Fn(&Point3<f64>) -> Point3<f64> + Send + Sync,
{
    fn to_cartesian(&self, point: &Point3<f64>) -> Point3<f64> {
        self(point)
    }
}
