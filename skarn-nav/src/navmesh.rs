//! The immutable navmesh query structure.
//!
//! Built once from the polygon and detail meshes; never mutated afterwards.
//! Vertices are in world units. Polygon adjacency is stored per edge as the
//! neighbouring polygon index.

use glam::Vec3;
use skarn_geom::{point_segment_distance_sq_xz, Aabb, Triangle};
use smallvec::SmallVec;
use std::fmt::Write as _;

use crate::compact::CompactHeightfield;
use crate::detail::{self, DetailMesh};
use crate::mesher::PolyMesh;
use crate::{VERTS_PER_POLY, WALKABLE_AREA, WALKABLE_FLAG};

#[derive(Clone, Debug)]
pub struct Polygon {
    /// Indices into [`NavMesh::vertices`].
    pub verts: SmallVec<[u32; VERTS_PER_POLY]>,
    /// Neighbour polygon per edge `(verts[i], verts[i+1])`.
    pub neighbours: SmallVec<[Option<u32>; VERTS_PER_POLY]>,
    pub area: u8,
    pub flags: u16,
    pub center: Vec3,
}

impl Polygon {
    pub fn is_walkable(&self) -> bool {
        self.flags & WALKABLE_FLAG != 0
    }
}

pub struct NavMesh {
    verts: Vec<Vec3>,
    polys: Vec<Polygon>,
    detail: DetailMesh,
    bounds: Aabb,
    cell_size: f32,
    cell_height: f32,
}

impl NavMesh {
    pub(crate) fn from_poly_mesh(
        poly_mesh: PolyMesh,
        detail: DetailMesh,
        chf: &CompactHeightfield,
    ) -> Self {
        let verts: Vec<Vec3> = poly_mesh
            .verts
            .iter()
            .map(|v| {
                Vec3::new(
                    chf.bmin.x + v[0] as f32 * chf.cell_size,
                    chf.bmin.y + v[1] as f32 * chf.cell_height,
                    chf.bmin.z + v[2] as f32 * chf.cell_size,
                )
            })
            .collect();

        let polys: Vec<Polygon> = poly_mesh
            .polys
            .iter()
            .map(|p| {
                let center = p
                    .verts
                    .iter()
                    .map(|&vi| verts[vi as usize])
                    .fold(Vec3::ZERO, |acc, v| acc + v)
                    / p.verts.len() as f32;
                Polygon {
                    verts: p.verts.clone(),
                    neighbours: p.neighbours.clone(),
                    area: p.area,
                    flags: if p.area == WALKABLE_AREA {
                        WALKABLE_FLAG
                    } else {
                        0
                    },
                    center,
                }
            })
            .collect();

        let bounds = Aabb::from_points(verts.iter().copied());

        Self {
            verts,
            polys,
            detail,
            bounds,
            cell_size: chf.cell_size,
            cell_height: chf.cell_height,
        }
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.verts
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polys
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn cell_height(&self) -> f32 {
        self.cell_height
    }

    pub(crate) fn poly_vertices(&self, poly: usize) -> SmallVec<[Vec3; VERTS_PER_POLY]> {
        self.polys[poly]
            .verts
            .iter()
            .map(|&vi| self.verts[vi as usize])
            .collect()
    }

    /// Accurate surface height at `p`'s XZ on the given polygon, from the
    /// detail triangulation. Falls back to the nearest detail vertex when the
    /// point projects outside every triangle (it can, slightly, after funnel
    /// tightening).
    pub(crate) fn poly_height(&self, poly: usize, p: Vec3) -> Option<f32> {
        let sub = self.detail.submeshes.get(poly)?;
        let tris =
            &self.detail.tris[sub.tri_base as usize..(sub.tri_base + sub.tri_count) as usize];
        for t in tris {
            let tri = Triangle::new(
                self.detail.verts[t[0] as usize],
                self.detail.verts[t[1] as usize],
                self.detail.verts[t[2] as usize],
            );
            if let Some(y) = tri.height_at_xz(p) {
                return Some(y);
            }
        }
        let verts = &self.detail.verts
            [sub.vert_base as usize..(sub.vert_base + sub.vert_count) as usize];
        verts
            .iter()
            .min_by(|a, b| {
                skarn_geom::horizontal_distance_sq(**a, p)
                    .total_cmp(&skarn_geom::horizontal_distance_sq(**b, p))
            })
            .map(|v| v.y)
    }

    /// Closest point to `p` on the polygon: `p`'s XZ with corrected height
    /// when inside, otherwise the closest point on the polygon boundary.
    pub(crate) fn closest_point_on_poly(&self, poly: usize, p: Vec3) -> Vec3 {
        let verts = self.poly_vertices(poly);
        if detail::point_in_poly_xz(&verts, p) {
            let y = self.poly_height(poly, p).unwrap_or(p.y);
            return Vec3::new(p.x, y, p.z);
        }

        let n = verts.len();
        let mut best = verts[0];
        let mut best_d = f32::INFINITY;
        for i in 0..n {
            let a = verts[i];
            let b = verts[(i + 1) % n];
            let d = point_segment_distance_sq_xz(p, a, b);
            if d < best_d {
                best_d = d;
                best = closest_point_on_segment_xz(p, a, b);
            }
        }
        if let Some(y) = self.poly_height(poly, best) {
            best.y = y;
        }
        best
    }

    /// Diagnostic Wavefront OBJ dump of the polygon mesh (fan-triangulated).
    pub fn export_obj(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# navmesh: {} verts, {} polys", self.verts.len(), self.polys.len());
        for v in &self.verts {
            let _ = writeln!(out, "v {} {} {}", v.x, v.y, v.z);
        }
        for poly in &self.polys {
            for i in 1..poly.verts.len() - 1 {
                let _ = writeln!(
                    out,
                    "f {} {} {}",
                    poly.verts[0] + 1,
                    poly.verts[i] + 1,
                    poly.verts[i + 1] + 1
                );
            }
        }
        out
    }
}

fn closest_point_on_segment_xz(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let d = abx * abx + abz * abz;
    let mut t = abx * (p.x - a.x) + abz * (p.z - a.z);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_navmesh, test_geometry, AgentConfig, TriangleInput};

    fn floor_mesh() -> NavMesh {
        let (positions, indices) = test_geometry::floor(12.0, 0.0);
        let input = TriangleInput {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        build_navmesh(&input, &AgentConfig::default()).unwrap()
    }

    #[test]
    fn polygons_are_walkable_with_flags() {
        let mesh = floor_mesh();
        for poly in mesh.polygons() {
            assert_eq!(poly.area, WALKABLE_AREA);
            assert!(poly.is_walkable());
            assert!(poly.verts.len() >= 3 && poly.verts.len() <= VERTS_PER_POLY);
        }
    }

    #[test]
    fn neighbours_are_symmetric() {
        let mesh = floor_mesh();
        for (pi, poly) in mesh.polygons().iter().enumerate() {
            for neighbour in poly.neighbours.iter().flatten() {
                let other = &mesh.polygons()[*neighbour as usize];
                assert!(
                    other
                        .neighbours
                        .iter()
                        .flatten()
                        .any(|&n| n as usize == pi),
                    "asymmetric adjacency {pi} <-> {neighbour}"
                );
            }
        }
    }

    #[test]
    fn closest_point_clamps_to_surface() {
        let mesh = floor_mesh();
        let inside = mesh.polygons()[0].center;
        let p = mesh.closest_point_on_poly(0, inside + Vec3::new(0.0, 3.0, 0.0));
        assert!((p.x - inside.x).abs() < 1e-4);
        assert!(p.y < 0.5, "snapped height {}", p.y);

        // A far point clamps to the polygon border.
        let far = Vec3::new(100.0, 0.0, 100.0);
        let clamped = mesh.closest_point_on_poly(0, far);
        assert!(mesh.bounds().contains(clamped) || clamped.y.abs() < 0.5);
    }

    #[test]
    fn obj_export_has_all_vertices() {
        let mesh = floor_mesh();
        let obj = mesh.export_obj();
        let vertex_lines = obj.lines().filter(|l| l.starts_with("v ")).count();
        assert_eq!(vertex_lines, mesh.vertices().len());
        assert!(obj.lines().any(|l| l.starts_with("f ")));
    }
}
