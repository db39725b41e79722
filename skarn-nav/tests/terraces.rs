//! Multi-level geometry: steps within the climb limit connect, taller ledges
//! split the mesh.

use std::sync::Arc;

use glam::Vec3;
use skarn_nav::{
    build_navmesh, validate_path, AgentConfig, NavError, NavMeshQuery, TriangleInput,
};

/// Two abutting 6x6m floor quads, the second raised by `step`.
fn terraced_soup(step: f32) -> (Vec<f32>, Vec<u32>) {
    let mut positions = Vec::new();
    let mut indices = Vec::new();
    for (x0, x1, y) in [(-6.0f32, 0.0f32, 0.0f32), (0.0, 6.0, step)] {
        let base = (positions.len() / 3) as u32;
        positions.extend_from_slice(&[
            x0, y, -3.0, //
            x0, y, 3.0, //
            x1, y, 3.0, //
            x1, y, -3.0,
        ]);
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (positions, indices)
}

fn query_for(step: f32) -> NavMeshQuery {
    let (positions, indices) = terraced_soup(step);
    let input = TriangleInput {
        positions: &positions,
        indices: &indices,
        areas: None,
    };
    let mesh = build_navmesh(&input, &AgentConfig::default()).unwrap();
    NavMeshQuery::new(Arc::new(mesh))
}

#[test]
fn climbable_step_connects_terraces() {
    let query = query_for(0.3);
    let path = query
        .find_path(
            Vec3::new(-4.0, 0.0, 0.0),
            Vec3::new(4.0, 0.3, 0.0),
            NavMeshQuery::default_extents(),
        )
        .expect("terraces within climb must connect");

    // The polyline crosses the step and stays traversable.
    assert!(path.waypoints.first().unwrap().x < -3.5);
    assert!(path.waypoints.last().unwrap().x > 3.5);
    assert!(validate_path(&path.waypoints, &AgentConfig::default()).is_ok());

    let rise = path.waypoints.last().unwrap().y - path.waypoints.first().unwrap().y;
    assert!((rise - 0.3).abs() < 0.2, "rise across terraces was {rise}");
}

#[test]
fn tall_ledge_splits_the_mesh() {
    let query = query_for(1.0);
    let result = query.find_path(
        Vec3::new(-4.0, 0.0, 0.0),
        Vec3::new(4.0, 1.0, 0.0),
        NavMeshQuery::default_extents(),
    );
    assert!(matches!(result, Err(NavError::NoPath)));
}

#[test]
fn snapping_prefers_the_nearest_level() {
    let query = query_for(1.0);
    // A point hovering over the upper terrace snaps to it, not the lower one.
    let (_, snapped) = query
        .nearest_walkable_polygon(Vec3::new(3.0, 1.4, 0.0), NavMeshQuery::default_extents())
        .unwrap();
    assert!((snapped.y - 1.0).abs() < 0.3, "snapped to {}", snapped.y);
    assert!((snapped.x - 3.0).abs() < 0.1);
}
