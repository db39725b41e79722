//! Path queries over a built navmesh.
//!
//! Snapping tolerates off-surface inputs (physics settling leaves agents a
//! little above or below the mesh), the search runs A* over polygon adjacency
//! with portal-midpoint costs, and the corridor is pulled tight with the
//! funnel algorithm before heights are recovered from the detail mesh.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use glam::Vec3;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::navmesh::NavMesh;
use crate::NavError;

/// Index of a polygon in the navmesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolyRef(pub u32);

/// An ordered waypoint polyline. The first waypoint is the snapped start, the
/// last the snapped goal.
#[derive(Clone, Debug)]
pub struct Path {
    pub waypoints: Vec<Vec3>,
    pub total_length: f32,
}

impl Path {
    pub(crate) fn from_waypoints(waypoints: Vec<Vec3>) -> Self {
        let total_length = waypoints
            .windows(2)
            .map(|w| w[0].distance(w[1]))
            .sum();
        Self {
            waypoints,
            total_length,
        }
    }
}

/// Read-only path planner over a shared navmesh.
#[derive(Clone)]
pub struct NavMeshQuery {
    mesh: Arc<NavMesh>,
}

impl NavMeshQuery {
    pub fn new(mesh: Arc<NavMesh>) -> Self {
        Self { mesh }
    }

    pub fn mesh(&self) -> &NavMesh {
        &self.mesh
    }

    /// Default snap extents; generous vertically because queries arrive after
    /// physics settling.
    pub fn default_extents() -> Vec3 {
        Vec3::new(5.0, 10.0, 5.0)
    }

    /// Nearest walkable polygon and the point on it closest to `point`,
    /// searched within the half-extents box.
    pub fn nearest_walkable_polygon(
        &self,
        point: Vec3,
        extents: Vec3,
    ) -> Result<(PolyRef, Vec3), NavError> {
        if !point.is_finite() {
            return Err(NavError::InvalidParameter("query point must be finite"));
        }
        let mut best: Option<(u32, Vec3, f32)> = None;
        for (pi, poly) in self.mesh.polygons().iter().enumerate() {
            if !poly.is_walkable() {
                continue;
            }
            let candidate = self.mesh.closest_point_on_poly(pi, point);
            let delta = candidate - point;
            if delta.x.abs() > extents.x || delta.y.abs() > extents.y || delta.z.abs() > extents.z {
                continue;
            }
            let d = delta.length_squared();
            if best.map(|(_, _, bd)| d < bd).unwrap_or(true) {
                best = Some((pi as u32, candidate, d));
            }
        }
        best.map(|(pi, p, _)| (PolyRef(pi), p))
            .ok_or(NavError::NotOnNavMesh)
    }

    /// Surface height near `point`, if the navmesh covers its XZ within the
    /// extents. Used by the movement layer's grounding controller.
    pub fn sample_surface_height(&self, point: Vec3, extents: Vec3) -> Option<f32> {
        self.nearest_walkable_polygon(point, extents)
            .ok()
            .map(|(_, snapped)| snapped.y)
    }

    /// A* + funnel. The returned polyline starts at the snapped start and
    /// ends at the snapped goal; every consecutive pair lies on a connected
    /// polygon corridor.
    pub fn find_path(&self, start: Vec3, goal: Vec3, extents: Vec3) -> Result<Path, NavError> {
        let (start_poly, start_point) = self.nearest_walkable_polygon(start, extents)?;
        let (goal_poly, goal_point) = self.nearest_walkable_polygon(goal, extents)?;

        if start_poly == goal_poly {
            return Ok(Path::from_waypoints(vec![start_point, goal_point]));
        }

        let corridor = self.search_corridor(start_poly.0, goal_poly.0, start_point, goal_point)?;
        trace!(polys = corridor.len(), "corridor found");

        let waypoints = self.string_pull(&corridor, start_point, goal_point);
        Ok(Path::from_waypoints(waypoints))
    }

    fn search_corridor(
        &self,
        start: u32,
        goal: u32,
        start_point: Vec3,
        goal_point: Vec3,
    ) -> Result<Vec<u32>, NavError> {
        #[derive(Copy, Clone, PartialEq)]
        struct Node {
            f: f32,
            poly: u32,
        }
        impl Eq for Node {}
        impl Ord for Node {
            fn cmp(&self, other: &Self) -> Ordering {
                other
                    .f
                    .partial_cmp(&self.f)
                    .unwrap_or(Ordering::Equal)
                    .then(other.poly.cmp(&self.poly))
            }
        }
        impl PartialOrd for Node {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let polys = self.mesh.polygons();
        let mut open = BinaryHeap::new();
        let mut came: FxHashMap<u32, u32> = FxHashMap::default();
        let mut g: FxHashMap<u32, f32> = FxHashMap::default();
        // Representative entry point per visited polygon: the snapped start
        // for the first, the portal midpoint afterwards.
        let mut entry: FxHashMap<u32, Vec3> = FxHashMap::default();

        g.insert(start, 0.0);
        entry.insert(start, start_point);
        open.push(Node {
            f: start_point.distance(goal_point),
            poly: start,
        });

        while let Some(Node { poly, .. }) = open.pop() {
            if poly == goal {
                let mut corridor = vec![goal];
                let mut current = goal;
                while let Some(&prev) = came.get(&current) {
                    corridor.push(prev);
                    current = prev;
                    if current == start {
                        break;
                    }
                }
                if *corridor.last().unwrap_or(&u32::MAX) != start {
                    return Err(NavError::NoPath);
                }
                corridor.reverse();
                return Ok(corridor);
            }

            let current_g = *g.get(&poly).unwrap_or(&f32::INFINITY);
            let current_point = *entry.get(&poly).unwrap_or(&start_point);

            let p = &polys[poly as usize];
            for (edge, neighbour) in p.neighbours.iter().enumerate() {
                let Some(next) = *neighbour else {
                    continue;
                };
                if !polys[next as usize].is_walkable() {
                    continue;
                }
                let (a, b) = self.portal(poly, edge);
                let midpoint = (a + b) * 0.5;
                let tentative = current_g + current_point.distance(midpoint);
                if tentative < *g.get(&next).unwrap_or(&f32::INFINITY) {
                    came.insert(next, poly);
                    g.insert(next, tentative);
                    entry.insert(next, midpoint);
                    open.push(Node {
                        f: tentative + midpoint.distance(goal_point),
                        poly: next,
                    });
                }
            }
        }

        Err(NavError::NoPath)
    }

    /// The shared-edge endpoints of `poly`'s `edge`.
    fn portal(&self, poly: u32, edge: usize) -> (Vec3, Vec3) {
        let p = &self.mesh.polygons()[poly as usize];
        let a = p.verts[edge];
        let b = p.verts[(edge + 1) % p.verts.len()];
        (
            self.mesh.vertices()[a as usize],
            self.mesh.vertices()[b as usize],
        )
    }

    fn portal_between(&self, from: u32, to: u32) -> Option<(Vec3, Vec3)> {
        let p = &self.mesh.polygons()[from as usize];
        for (edge, neighbour) in p.neighbours.iter().enumerate() {
            if *neighbour == Some(to) {
                return Some(self.portal(from, edge));
            }
        }
        None
    }

    /// Funnel algorithm over the corridor portals, then height recovery from
    /// the detail mesh.
    fn string_pull(&self, corridor: &[u32], start: Vec3, goal: Vec3) -> Vec<Vec3> {
        // Portals oriented left/right relative to the direction of travel.
        let mut portals: Vec<(Vec3, Vec3)> = Vec::with_capacity(corridor.len() + 1);
        portals.push((start, start));
        for w in corridor.windows(2) {
            let Some((a, b)) = self.portal_between(w[0], w[1]) else {
                // Broken adjacency; fall back to polygon centers.
                let c = self.mesh.polygons()[w[1] as usize].center;
                portals.push((c, c));
                continue;
            };
            let from = self.mesh.polygons()[w[0] as usize].center;
            let to = self.mesh.polygons()[w[1] as usize].center;
            if triarea2(from, to, a) < 0.0 {
                portals.push((a, b));
            } else {
                portals.push((b, a));
            }
        }
        portals.push((goal, goal));

        let mut points = vec![start];
        funnel(&portals, &mut points);
        points.push(goal);

        // Recover accurate heights from the corridor's detail meshes.
        for point in points.iter_mut() {
            for &poly in corridor {
                let verts = self.mesh.poly_vertices(poly as usize);
                if crate::detail::point_in_poly_xz(&verts, *point) {
                    if let Some(y) = self.mesh.poly_height(poly as usize, *point) {
                        point.y = y;
                    }
                    break;
                }
            }
        }

        // Drop consecutive duplicates the funnel can leave at portal corners.
        points.dedup_by(|a, b| a.distance_squared(*b) < 1e-8);
        if points.len() < 2 {
            points.push(goal);
        }
        points
    }
}

fn triarea2(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

fn close_enough(a: Vec3, b: Vec3) -> bool {
    skarn_geom::horizontal_distance_sq(a, b) < 1e-6
}

/// Simple stupid funnel: tighten the corridor into the minimal polyline,
/// emitting a corner every time the funnel collapses.
fn funnel(portals: &[(Vec3, Vec3)], out: &mut Vec<Vec3>) {
    if portals.is_empty() {
        return;
    }

    let (mut apex, _) = portals[0];
    let mut left = apex;
    let mut right = apex;
    let mut apex_index = 0usize;
    let mut left_index = 0usize;
    let mut right_index = 0usize;

    let mut i = 1;
    let mut guard = 0usize;
    let guard_limit = portals.len() * portals.len() + 16;

    while i < portals.len() {
        guard += 1;
        if guard > guard_limit {
            break;
        }
        let (portal_left, portal_right) = portals[i];

        // Tighten the right side.
        if triarea2(apex, right, portal_right) <= 0.0 {
            if close_enough(apex, right) || triarea2(apex, left, portal_right) > 0.0 {
                right = portal_right;
                right_index = i;
            } else {
                // Right crossed over left: the left vertex is a corner.
                out.push(left);
                apex = left;
                apex_index = left_index;
                left = apex;
                right = apex;
                left_index = apex_index;
                right_index = apex_index;
                i = apex_index + 1;
                continue;
            }
        }

        // Tighten the left side.
        if triarea2(apex, left, portal_left) >= 0.0 {
            if close_enough(apex, left) || triarea2(apex, right, portal_left) < 0.0 {
                left = portal_left;
                left_index = i;
            } else {
                out.push(right);
                apex = right;
                apex_index = right_index;
                left = apex;
                right = apex;
                left_index = apex_index;
                right_index = apex_index;
                i = apex_index + 1;
                continue;
            }
        }

        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_navmesh, test_geometry, AgentConfig, TriangleInput};

    fn query_for(positions: Vec<f32>, indices: Vec<u32>) -> NavMeshQuery {
        let input = TriangleInput {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let mesh = build_navmesh(&input, &AgentConfig::default()).unwrap();
        NavMeshQuery::new(Arc::new(mesh))
    }

    #[test]
    fn snaps_off_surface_points() {
        let (positions, indices) = test_geometry::floor(20.0, 0.0);
        let query = query_for(positions, indices);

        let (_, snapped) = query
            .nearest_walkable_polygon(Vec3::new(2.0, 1.4, 3.0), NavMeshQuery::default_extents())
            .unwrap();
        assert!((snapped.x - 2.0).abs() < 0.01);
        assert!((snapped.z - 3.0).abs() < 0.01);
        assert!(snapped.y.abs() < 0.3);

        // Far outside the floor and extents.
        assert!(matches!(
            query.nearest_walkable_polygon(
                Vec3::new(100.0, 0.0, 0.0),
                Vec3::new(2.0, 2.0, 2.0)
            ),
            Err(NavError::NotOnNavMesh)
        ));
    }

    #[test]
    fn straight_path_on_open_floor() {
        let (positions, indices) = test_geometry::floor(20.0, 0.0);
        let query = query_for(positions, indices);

        let start = Vec3::new(-8.0, 0.0, 0.0);
        let goal = Vec3::new(8.0, 0.0, 0.0);
        let path = query
            .find_path(start, goal, NavMeshQuery::default_extents())
            .unwrap();

        assert!(path.waypoints.len() >= 2);
        assert!(skarn_geom::horizontal_distance(path.waypoints[0], start) < 0.1);
        assert!(
            skarn_geom::horizontal_distance(*path.waypoints.last().unwrap(), goal) < 0.1
        );
        // Funnel should keep an open-floor path near the straight line.
        assert!(path.total_length < start.distance(goal) * 1.25);
    }

    #[test]
    fn path_goes_around_wall() {
        let (mut positions, mut indices) = test_geometry::floor(20.0, 0.0);
        // Wall: 1 wide (x), 5 tall, 8 deep (z), centered at origin.
        test_geometry::append_box(
            &mut positions,
            &mut indices,
            Vec3::new(0.0, 2.5, 0.0),
            Vec3::new(0.5, 2.5, 4.0),
        );
        let query = query_for(positions, indices);

        let path = query
            .find_path(
                Vec3::new(-5.0, 0.0, 0.0),
                Vec3::new(6.0, 0.0, 0.0),
                NavMeshQuery::default_extents(),
            )
            .unwrap();

        // Midpoints must detour around the wall footprint.
        for w in path.waypoints.windows(2) {
            let mid = (w[0] + w[1]) * 0.5;
            let inside_wall = mid.x.abs() < 0.5 && mid.z.abs() < 4.0;
            assert!(!inside_wall, "midpoint {mid} crosses the wall");
        }
        assert!(path.total_length > 11.0);
    }

    #[test]
    fn disconnected_islands_have_no_path() {
        let (mut positions, mut indices) = test_geometry::floor(8.0, 0.0);
        // Second floor far away on +x; use its own vertices.
        let (p2, i2) = test_geometry::floor(8.0, 0.0);
        let base = (positions.len() / 3) as u32;
        for chunk in p2.chunks(3) {
            positions.extend_from_slice(&[chunk[0] + 40.0, chunk[1], chunk[2]]);
        }
        indices.extend(i2.iter().map(|i| i + base));
        let query = query_for(positions, indices);

        let result = query.find_path(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(40.0, 0.0, 0.0),
            NavMeshQuery::default_extents(),
        );
        assert!(matches!(result, Err(NavError::NoPath)));
    }

    #[test]
    fn surface_height_sampling() {
        let (positions, indices) = test_geometry::floor(10.0, 2.0);
        let query = query_for(positions, indices);
        let y = query
            .sample_surface_height(Vec3::new(0.0, 3.5, 0.0), Vec3::new(1.0, 2.0, 1.0))
            .unwrap();
        assert!((y - 2.0).abs() < 0.3, "height {y}");
    }
}
