//! Convex polygon mesh construction from simplified contours.
//!
//! Each contour is ear-clipped into triangles, the triangles are greedily
//! merged back into convex polygons of at most [`VERTS_PER_POLY`] vertices,
//! and polygon adjacency is recovered from shared edges across the whole
//! mesh.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::contour::Contour;
use crate::VERTS_PER_POLY;

#[derive(Clone, Debug)]
pub(crate) struct MeshPoly {
    /// Vertex indices, counter-clockwise seen from above.
    pub verts: SmallVec<[u32; VERTS_PER_POLY]>,
    /// Neighbour polygon per edge `(verts[i], verts[i+1])`.
    pub neighbours: SmallVec<[Option<u32>; VERTS_PER_POLY]>,
    pub region: u16,
    pub area: u8,
}

pub(crate) struct PolyMesh {
    /// Vertices in voxel units.
    pub verts: Vec<[i32; 3]>,
    pub polys: Vec<MeshPoly>,
}

pub(crate) fn build_poly_mesh(contours: &[Contour]) -> Option<PolyMesh> {
    let mut verts: Vec<[i32; 3]> = Vec::new();
    let mut vert_buckets: FxHashMap<(i32, i32), Vec<u32>> = FxHashMap::default();
    let mut polys: Vec<MeshPoly> = Vec::new();

    let mut add_vertex = |v: [i32; 3],
                          verts: &mut Vec<[i32; 3]>,
                          buckets: &mut FxHashMap<(i32, i32), Vec<u32>>|
     -> u32 {
        let key = (v[0], v[2]);
        if let Some(bucket) = buckets.get(&key) {
            for &i in bucket {
                // Corner heights from neighbouring regions may differ by a
                // voxel; weld them.
                if (verts[i as usize][1] - v[1]).abs() <= 2 {
                    return i;
                }
            }
        }
        let index = verts.len() as u32;
        verts.push(v);
        buckets.entry(key).or_default().push(index);
        index
    };

    for contour in contours {
        if contour.vertices.len() < 3 {
            continue;
        }
        let triangles = triangulate(&contour.vertices);
        if triangles.is_empty() {
            continue;
        }

        let indices: Vec<u32> = contour
            .vertices
            .iter()
            .map(|v| add_vertex([v[0], v[1], v[2]], &mut verts, &mut vert_buckets))
            .collect();

        // Seed polygons with the triangles, dropping degenerate welds.
        let mut contour_polys: Vec<SmallVec<[u32; VERTS_PER_POLY]>> = triangles
            .iter()
            .map(|t| {
                let mut p = SmallVec::new();
                p.push(indices[t[0]]);
                p.push(indices[t[1]]);
                p.push(indices[t[2]]);
                p
            })
            .filter(|p: &SmallVec<[u32; VERTS_PER_POLY]>| {
                p[0] != p[1] && p[1] != p[2] && p[2] != p[0]
            })
            .collect();

        // Greedy merge: longest shared edge first, convexity preserved.
        loop {
            let mut best: Option<(usize, usize, usize, usize, i64)> = None;
            for a in 0..contour_polys.len() {
                for b in a + 1..contour_polys.len() {
                    if let Some((ea, eb, value)) =
                        poly_merge_value(&contour_polys[a], &contour_polys[b], &verts)
                    {
                        if best.map(|(.., v)| value > v).unwrap_or(true) {
                            best = Some((a, b, ea, eb, value));
                        }
                    }
                }
            }
            let Some((a, b, ea, eb, _)) = best else {
                break;
            };
            let merged = merge_polys(&contour_polys[a], &contour_polys[b], ea, eb);
            contour_polys[a] = merged;
            contour_polys.swap_remove(b);
        }

        for poly_verts in contour_polys {
            let n = poly_verts.len();
            polys.push(MeshPoly {
                verts: poly_verts,
                neighbours: std::iter::repeat(None).take(n).collect(),
                region: contour.region,
                area: contour.area,
            });
        }
    }

    if polys.is_empty() {
        return None;
    }

    build_adjacency(&mut polys);
    debug!(polys = polys.len(), verts = verts.len(), "built polygon mesh");
    Some(PolyMesh { verts, polys })
}

/// Shared-edge adjacency across the whole mesh.
fn build_adjacency(polys: &mut [MeshPoly]) {
    let mut edges: FxHashMap<(u32, u32), (u32, usize)> = FxHashMap::default();
    for (pi, poly) in polys.iter().enumerate() {
        for ei in 0..poly.verts.len() {
            let a = poly.verts[ei];
            let b = poly.verts[(ei + 1) % poly.verts.len()];
            let key = (a.min(b), a.max(b));
            edges.entry(key).or_insert((pi as u32, ei));
        }
    }
    for pi in 0..polys.len() {
        for ei in 0..polys[pi].verts.len() {
            let a = polys[pi].verts[ei];
            let b = polys[pi].verts[(ei + 1) % polys[pi].verts.len()];
            let key = (a.min(b), a.max(b));
            if let Some(&(opi, oei)) = edges.get(&key) {
                if opi as usize != pi {
                    polys[pi].neighbours[ei] = Some(opi);
                    polys[opi as usize].neighbours[oei] = Some(pi as u32);
                }
            }
        }
    }
}

/// Whether `a` and `b` share an edge and merging keeps the result convex and
/// small enough. Returns `(edge_a, edge_b, squared_edge_length)`.
fn poly_merge_value(
    a: &SmallVec<[u32; VERTS_PER_POLY]>,
    b: &SmallVec<[u32; VERTS_PER_POLY]>,
    verts: &[[i32; 3]],
) -> Option<(usize, usize, i64)> {
    let na = a.len();
    let nb = b.len();
    if na + nb - 2 > VERTS_PER_POLY {
        return None;
    }

    let mut shared: Option<(usize, usize)> = None;
    for i in 0..na {
        let va0 = a[i];
        let va1 = a[(i + 1) % na];
        for j in 0..nb {
            let vb0 = b[j];
            let vb1 = b[(j + 1) % nb];
            if va0 == vb1 && va1 == vb0 {
                shared = Some((i, j));
            }
        }
    }
    let (ea, eb) = shared?;

    // Strict convexity at the two junction vertices after the merge;
    // collinear junctions would leave degenerate corners behind.
    let before_a = a[(ea + na - 1) % na];
    let shared0 = a[ea];
    let after_b = b[(eb + 2) % nb];
    if !uleft(verts, before_a, shared0, after_b) {
        return None;
    }
    let before_b = b[(eb + nb - 1) % nb];
    let shared1 = a[(ea + 1) % na];
    let after_a = a[(ea + 2) % na];
    if !uleft(verts, before_b, shared1, after_a) {
        return None;
    }

    let pa = verts[shared0 as usize];
    let pb = verts[shared1 as usize];
    let dx = (pa[0] - pb[0]) as i64;
    let dz = (pa[2] - pb[2]) as i64;
    Some((ea, eb, dx * dx + dz * dz))
}

fn uleft(verts: &[[i32; 3]], a: u32, b: u32, c: u32) -> bool {
    area2_indexed(verts, a, b, c) < 0
}

fn area2_indexed(verts: &[[i32; 3]], a: u32, b: u32, c: u32) -> i64 {
    let (a, b, c) = (
        verts[a as usize],
        verts[b as usize],
        verts[c as usize],
    );
    (b[0] - a[0]) as i64 * (c[2] - a[2]) as i64 - (c[0] - a[0]) as i64 * (b[2] - a[2]) as i64
}

/// Join two polygons across the shared edge, walking each from just past the
/// junction.
fn merge_polys(
    a: &SmallVec<[u32; VERTS_PER_POLY]>,
    b: &SmallVec<[u32; VERTS_PER_POLY]>,
    ea: usize,
    eb: usize,
) -> SmallVec<[u32; VERTS_PER_POLY]> {
    let na = a.len();
    let nb = b.len();
    let mut merged = SmallVec::new();
    for i in 0..na - 1 {
        merged.push(a[(ea + 1 + i) % na]);
    }
    for i in 0..nb - 1 {
        merged.push(b[(eb + 1 + i) % nb]);
    }
    merged
}

// --- contour triangulation --------------------------------------------------

fn prev(i: usize, n: usize) -> usize {
    (i + n - 1) % n
}

fn next(i: usize, n: usize) -> usize {
    (i + 1) % n
}

fn area2(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> i64 {
    (b[0] - a[0]) as i64 * (c[2] - a[2]) as i64 - (c[0] - a[0]) as i64 * (b[2] - a[2]) as i64
}

fn left(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) < 0
}

fn left_on(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) <= 0
}

fn collinear(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) == 0
}

fn intersect_prop(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

fn between(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a[0] != b[0] {
        (a[0] <= c[0] && c[0] <= b[0]) || (a[0] >= c[0] && c[0] >= b[0])
    } else {
        (a[2] <= c[2] && c[2] <= b[2]) || (a[2] >= c[2] && c[2] >= b[2])
    }
}

fn intersect(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// True when segment `ring[i]`-`ring[j]` crosses no ring edge.
fn diagonalie(i: usize, j: usize, ring: &[usize], verts: &[[i32; 4]]) -> bool {
    let n = ring.len();
    let d0 = &verts[ring[i]];
    let d1 = &verts[ring[j]];
    for k in 0..n {
        let k1 = next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = &verts[ring[k]];
        let p1 = &verts[ring[k1]];
        if (d0[0] == p0[0] && d0[2] == p0[2])
            || (d1[0] == p0[0] && d1[2] == p0[2])
            || (d0[0] == p1[0] && d0[2] == p1[2])
            || (d1[0] == p1[0] && d1[2] == p1[2])
        {
            continue;
        }
        if intersect(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

fn in_cone(i: usize, j: usize, ring: &[usize], verts: &[[i32; 4]]) -> bool {
    let n = ring.len();
    let pi = &verts[ring[i]];
    let pj = &verts[ring[j]];
    let pi1 = &verts[ring[next(i, n)]];
    let pin1 = &verts[ring[prev(i, n)]];

    if left_on(pin1, pi, pi1) {
        left(pi, pj, pin1) && left(pj, pi, pi1)
    } else {
        !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
    }
}

fn diagonal(i: usize, j: usize, ring: &[usize], verts: &[[i32; 4]]) -> bool {
    in_cone(i, j, ring, verts) && diagonalie(i, j, ring, verts)
}

/// Ear-clip a simplified contour. Returns triangles as indices into the
/// contour vertex array; empty when the outline is too broken to triangulate.
fn triangulate(verts: &[[i32; 4]]) -> Vec<[usize; 3]> {
    let n = verts.len();
    let mut ring: Vec<usize> = (0..n).collect();
    let mut ear: Vec<bool> = vec![false; n];
    let mut tris = Vec::with_capacity(n.saturating_sub(2));

    for i in 0..ring.len() {
        let i1 = next(i, ring.len());
        ear[i1] = diagonal(i, next(i1, ring.len()), &ring, verts);
    }

    while ring.len() > 3 {
        let m = ring.len();
        let mut min_len = i64::MAX;
        let mut min_i = None;
        for i in 0..m {
            let i1 = next(i, m);
            if !ear[i1] {
                continue;
            }
            let p0 = &verts[ring[i]];
            let p2 = &verts[ring[next(i1, m)]];
            let dx = (p2[0] - p0[0]) as i64;
            let dz = (p2[2] - p0[2]) as i64;
            let len = dx * dx + dz * dz;
            if len < min_len {
                min_len = len;
                min_i = Some(i);
            }
        }

        let i = match min_i {
            Some(i) => i,
            // No clean ear: the contour self-overlaps somewhere. Give up on
            // this outline rather than emit twisted polygons.
            None => return Vec::new(),
        };

        let i1 = next(i, m);
        let i2 = next(i1, m);
        tris.push([ring[i], ring[i1], ring[i2]]);

        ring.remove(i1);
        ear.remove(i1);
        let m = ring.len();
        let i = if i1 == 0 { m - 1 } else { i1 - 1 };
        let i1 = i1 % m;
        ear[i] = diagonal(prev(i, m), i1, &ring, verts);
        ear[i1] = diagonal(i, next(i1, m), &ring, verts);
    }

    tris.push([ring[0], ring[1], ring[2]]);
    tris
}
