//! Vertex buffer input and output through interleaved layouts.

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};
use sim_deformable::{Masses, Model, ModelDescriptor, Region, VertexLayout};
use sim_tasks::SingleThreadPrimFactory;

use crate::common::{DT, lattice};

/// 48-byte records: a 4-byte tag, position, normal, a gap, an anchor point.
fn layout() -> VertexLayout {
    VertexLayout::new(48, 4)
        .unwrap()
        .with_vector(16)
        .unwrap()
        .with_point(32)
        .unwrap()
}

const ANCHOR: Vector3<f64> = Vector3::new(0.0, 0.0, 0.5);

fn source(layout: &VertexLayout, positions: &[Point3<f64>]) -> Vec<u8> {
    let mut buffer = vec![0u8; layout.required_len(positions.len()).unwrap()];
    for (i, p) in positions.iter().enumerate() {
        let base = i * layout.stride();
        let tag = u32::try_from(i).unwrap().to_ne_bytes();
        buffer[base..base + 4].copy_from_slice(&tag);
        layout.write_position(&mut buffer, i, p).unwrap();
        layout
            .write_vector(&mut buffer, i, 0, &Vector3::z())
            .unwrap();
        layout
            .write_point(&mut buffer, i, 0, &(p + ANCHOR))
            .unwrap();
    }
    buffer
}

fn model_from(buffer: &[u8], layout: &VertexLayout, count: usize) -> Model {
    let descriptor = ModelDescriptor::new(buffer, count, layout);
    Model::new(&descriptor, Arc::new(SingleThreadPrimFactory)).unwrap()
}

#[test]
fn round_trip_reproduces_source() {
    let layout = layout();
    let positions = lattice(3);
    let source = source(&layout, &positions);
    let model = model_from(&source, &layout, positions.len());

    let mut out = vec![0xAB_u8; source.len()];
    model
        .update_vertices(&mut out, &layout, 0..positions.len(), None)
        .unwrap();

    for (i, p) in positions.iter().enumerate() {
        assert_relative_eq!(layout.read_position(&out, i).unwrap(), *p, epsilon = 1e-6);
        assert_relative_eq!(
            layout.read_vectors(&out, i).unwrap()[0],
            Vector3::z(),
            epsilon = 1e-6
        );
        assert_relative_eq!(
            layout.read_points(&out, i).unwrap()[0],
            p + ANCHOR,
            epsilon = 1e-6
        );
        // Bytes outside the engine's fields are left alone.
        let base = i * layout.stride();
        assert!(out[base..base + 4].iter().all(|&b| b == 0xAB));
        assert!(out[base + 28..base + 32].iter().all(|&b| b == 0xAB));
        assert!(out[base + 44..base + 48].iter().all(|&b| b == 0xAB));
    }
}

#[test]
fn per_vertex_masses_are_read() {
    let layout = layout();
    let positions = lattice(2);
    let source = source(&layout, &positions);
    let masses: Vec<f64> = (1..=8).map(f64::from).collect();
    let descriptor =
        ModelDescriptor::new(&source, 8, &layout).with_masses(Masses::PerVertex(&masses));
    let model = Model::new(&descriptor, Arc::new(SingleThreadPrimFactory)).unwrap();

    for (i, m) in masses.iter().enumerate() {
        assert_relative_eq!(model.vertex(i).unwrap().mass, *m);
    }
}

#[test]
fn split_ranges_match_full_update() {
    let layout = layout();
    let positions = lattice(3);
    let source = source(&layout, &positions);
    let mut model = model_from(&source, &layout, positions.len());

    let whole = Region::aabb(Point3::new(-1.0, -1.0, -1.0), Point3::new(3.0, 3.0, 3.0));
    model.hit(&whole, &Vector3::new(0.5, 0.0, -0.25));
    for _ in 0..3 {
        model.step(&[], DT).unwrap();
    }

    let mut full = vec![0u8; source.len()];
    model
        .update_vertices(&mut full, &layout, 0..27, None)
        .unwrap();
    let mut split = vec![0u8; source.len()];
    model
        .update_vertices(&mut split, &layout, 0..9, None)
        .unwrap();
    model
        .update_vertices(&mut split, &layout, 9..27, None)
        .unwrap();
    assert_eq!(full, split);

    let shift = Vector3::new(0.5, 0.0, -0.25) * (3.0 * DT);
    for (i, p) in positions.iter().enumerate() {
        assert_relative_eq!(
            layout.read_position(&full, i).unwrap(),
            p + shift,
            epsilon = 1e-5
        );
        assert_relative_eq!(
            layout.read_points(&full, i).unwrap()[0],
            p + ANCHOR + shift,
            epsilon = 1e-5
        );
    }
}

#[test]
fn sheared_body_rotates_normals() {
    let layout = layout();
    let positions = lattice(3);
    let source = source(&layout, &positions);
    let mut model = model_from(&source, &layout, positions.len());

    let top = Region::aabb(Point3::new(-1.0, -1.0, 1.9), Point3::new(3.0, 3.0, 2.1));
    let bottom = Region::aabb(Point3::new(-1.0, -1.0, -0.1), Point3::new(3.0, 3.0, 0.1));
    model.hit(&top, &Vector3::new(1.0, 0.0, 0.0));
    model.hit(&bottom, &Vector3::new(-1.0, 0.0, 0.0));
    for _ in 0..2 {
        model.step(&[], DT).unwrap();
    }

    let mut out = vec![0u8; source.len()];
    model
        .update_vertices(&mut out, &layout, 0..27, None)
        .unwrap();
    let normals: Vec<Vector3<f64>> = (0..27)
        .map(|i| layout.read_vectors(&out, i).unwrap()[0])
        .collect();
    for n in &normals {
        assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-5);
    }
    assert!(normals.iter().any(|n| n.x.abs() > 1e-6));
}
