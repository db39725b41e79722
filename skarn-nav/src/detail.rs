//! Per-polygon detail triangulation.
//!
//! Navmesh polygons flatten the surface between contour vertices; queries that
//! need an accurate Y (height snapping, waypoint grounding) read the detail
//! mesh instead. Each polygon starts as a fan over its vertices and gains
//! interior samples wherever the flat interpolation drifts more than the
//! configured error from the voxelized surface.

use glam::Vec3;
use skarn_geom::Triangle;

use crate::compact::CompactHeightfield;
use crate::mesher::PolyMesh;
use crate::AgentConfig;

/// Hard cap on inserted samples per polygon; the sampler converges long
/// before this on sane geometry.
const MAX_EXTRA_SAMPLES: usize = 32;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SubMesh {
    pub vert_base: u32,
    pub vert_count: u32,
    pub tri_base: u32,
    pub tri_count: u32,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct DetailMesh {
    pub submeshes: Vec<SubMesh>,
    pub verts: Vec<Vec3>,
    /// Indices into `verts`, global.
    pub tris: Vec<[u32; 3]>,
}

pub(crate) fn build_detail_mesh(
    poly_mesh: &PolyMesh,
    chf: &CompactHeightfield,
    config: &AgentConfig,
) -> DetailMesh {
    let sample_dist = config.detail_sample_dist().max(chf.cell_size);
    let max_error = config.detail_sample_max_err();

    let mut detail = DetailMesh::default();

    for poly in &poly_mesh.polys {
        let mut verts: Vec<Vec3> = poly
            .verts
            .iter()
            .map(|&vi| {
                let v = poly_mesh.verts[vi as usize];
                Vec3::new(
                    chf.bmin.x + v[0] as f32 * chf.cell_size,
                    chf.bmin.y + v[1] as f32 * chf.cell_height,
                    chf.bmin.z + v[2] as f32 * chf.cell_size,
                )
            })
            .collect();
        let hull_len = verts.len();

        // Convex fan; winding follows the polygon.
        let mut tris: Vec<[u32; 3]> = (1..hull_len - 1)
            .map(|i| [0u32, i as u32, i as u32 + 1])
            .collect();

        // Interior samples where the flat surface is wrong.
        let hull: Vec<Vec3> = verts.clone();
        let (min, max) = xz_bounds(&hull);
        let mut samples: Vec<Vec3> = Vec::new();
        let mut z = (min.1 / sample_dist).floor() * sample_dist;
        while z <= max.1 {
            let mut x = (min.0 / sample_dist).floor() * sample_dist;
            while x <= max.0 {
                let p = Vec3::new(x, 0.0, z);
                if point_in_poly_xz(&hull, p) {
                    let hint = surface_height(&verts, &tris, p)
                        .unwrap_or_else(|| hull.iter().map(|v| v.y).sum::<f32>() / hull_len as f32);
                    if let Some(y) = sample_floor_height(chf, x, z, hint) {
                        samples.push(Vec3::new(x, y, z));
                    }
                }
                x += sample_dist;
            }
            z += sample_dist;
        }

        for _ in 0..MAX_EXTRA_SAMPLES {
            let mut worst: Option<(usize, f32)> = None;
            for (i, sample) in samples.iter().enumerate() {
                let Some(mesh_y) = surface_height(&verts, &tris, *sample) else {
                    continue;
                };
                let error = (sample.y - mesh_y).abs();
                if error > max_error && worst.map(|(_, e)| error > e).unwrap_or(true) {
                    worst = Some((i, error));
                }
            }
            let Some((index, _)) = worst else {
                break;
            };
            let sample = samples.swap_remove(index);
            if !insert_sample(&mut verts, &mut tris, sample) {
                break;
            }
        }

        let vert_base = detail.verts.len() as u32;
        let tri_base = detail.tris.len() as u32;
        detail
            .tris
            .extend(tris.iter().map(|t| t.map(|i| i + vert_base)));
        detail.submeshes.push(SubMesh {
            vert_base,
            vert_count: verts.len() as u32,
            tri_base,
            tri_count: tris.len() as u32,
        });
        detail.verts.append(&mut verts);
    }

    detail
}

fn xz_bounds(verts: &[Vec3]) -> ((f32, f32), (f32, f32)) {
    let mut min = (f32::INFINITY, f32::INFINITY);
    let mut max = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    for v in verts {
        min.0 = min.0.min(v.x);
        min.1 = min.1.min(v.z);
        max.0 = max.0.max(v.x);
        max.1 = max.1.max(v.z);
    }
    (min, max)
}

/// Winding-agnostic convex containment on the XZ plane.
pub(crate) fn point_in_poly_xz(verts: &[Vec3], p: Vec3) -> bool {
    let n = verts.len();
    let mut sign = 0.0f32;
    for i in 0..n {
        let a = verts[i];
        let b = verts[(i + 1) % n];
        let cross = (b.x - a.x) * (p.z - a.z) - (b.z - a.z) * (p.x - a.x);
        if cross.abs() < 1e-9 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Height of the current detail triangulation at `p`'s XZ.
fn surface_height(verts: &[Vec3], tris: &[[u32; 3]], p: Vec3) -> Option<f32> {
    for t in tris {
        let tri = Triangle::new(
            verts[t[0] as usize],
            verts[t[1] as usize],
            verts[t[2] as usize],
        );
        if let Some(y) = tri.height_at_xz(p) {
            return Some(y);
        }
    }
    None
}

/// Split the triangle containing `sample` into three. Returns false when no
/// triangle strictly contains the point (edge hits are skipped).
fn insert_sample(verts: &mut Vec<Vec3>, tris: &mut Vec<[u32; 3]>, sample: Vec3) -> bool {
    let containing = tris.iter().position(|t| {
        let tri = [
            verts[t[0] as usize],
            verts[t[1] as usize],
            verts[t[2] as usize],
        ];
        strictly_inside_xz(&tri, sample)
    });
    let Some(ti) = containing else {
        return false;
    };
    let [a, b, c] = tris.swap_remove(ti);
    let s = verts.len() as u32;
    verts.push(sample);
    tris.push([a, b, s]);
    tris.push([b, c, s]);
    tris.push([c, a, s]);
    true
}

fn strictly_inside_xz(tri: &[Vec3; 3], p: Vec3) -> bool {
    let cross = |a: Vec3, b: Vec3| (b.x - a.x) * (p.z - a.z) - (b.z - a.z) * (p.x - a.x);
    let d0 = cross(tri[0], tri[1]);
    let d1 = cross(tri[1], tri[2]);
    let d2 = cross(tri[2], tri[0]);
    let eps = 1e-6;
    (d0 > eps && d1 > eps && d2 > eps) || (d0 < -eps && d1 < -eps && d2 < -eps)
}

/// Walkable floor height of the compact heightfield at a world XZ, preferring
/// the span nearest to `y_hint`.
pub(crate) fn sample_floor_height(
    chf: &CompactHeightfield,
    wx: f32,
    wz: f32,
    y_hint: f32,
) -> Option<f32> {
    let cx = ((wx - chf.bmin.x) / chf.cell_size).floor() as i64;
    let cz = ((wz - chf.bmin.z) / chf.cell_size).floor() as i64;
    let cx = cx.clamp(0, chf.width as i64 - 1) as usize;
    let cz = cz.clamp(0, chf.depth as i64 - 1) as usize;

    let cell = chf.cells[chf.cell_index(cx, cz)];
    let mut best: Option<f32> = None;
    for si in cell.first as usize..(cell.first + cell.count) as usize {
        let y = chf.bmin.y + chf.spans[si].y as f32 * chf.cell_height;
        best = Some(match best {
            Some(current) if (current - y_hint).abs() <= (y - y_hint).abs() => current,
            _ => y,
        });
    }
    best
}
