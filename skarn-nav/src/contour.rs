//! Region boundary tracing and contour simplification.
//!
//! Walks the outline of every region in the compact heightfield, collecting
//! corner vertices in voxel coordinates, then simplifies each outline: only
//! vertices where the bordering region changes are structural; null-region
//! (wall) stretches are re-tessellated until they deviate less than the
//! configured error and no edge exceeds the maximum length.

use crate::compact::{CompactHeightfield, CompactSpan};
use crate::{AgentConfig, NULL_AREA};

/// A simplified region outline. Vertex layout: x, y, z in voxel units, w =
/// bordering region id (0 against walls).
#[derive(Clone, Debug)]
pub(crate) struct Contour {
    pub vertices: Vec<[i32; 4]>,
    pub region: u16,
    pub area: u8,
}

pub(crate) fn build_contours(
    chf: &CompactHeightfield,
    max_error: f32,
    config: &AgentConfig,
) -> Vec<Contour> {
    let max_edge_len = (config.edge_max_len() / chf.cell_size) as i32;
    let mut contours = Vec::with_capacity(chf.max_region as usize);

    // Mark, per span, the directions where the neighbouring region differs.
    let mut boundary_flags = vec![0u8; chf.spans.len()];
    for (cx, cz, si) in chf.iter_spans() {
        let span = chf.spans[si];
        let mut connected = 0u8;
        for dir in 0..4 {
            let neighbour_region = chf
                .connection(cx, cz, &span, dir)
                .map(|ni| chf.spans[ni].region)
                .unwrap_or(0);
            if span.region == neighbour_region {
                connected |= 1 << dir;
            }
        }
        boundary_flags[si] = connected ^ 0b1111;
    }

    let mut raw = Vec::with_capacity(256);
    let mut simplified = Vec::with_capacity(64);

    for (cx, cz, si) in chf.iter_spans() {
        if boundary_flags[si] == 0 || boundary_flags[si] == 0b1111 {
            boundary_flags[si] = 0;
            continue;
        }
        let span = chf.spans[si];
        if span.region == 0 || chf.areas[si] == NULL_AREA {
            continue;
        }

        raw.clear();
        walk_contour(cx, cz, si, chf, &mut boundary_flags, &mut raw);

        simplified.clear();
        simplify_contour(&raw, &mut simplified, max_error, max_edge_len);
        remove_degenerate_segments(&mut simplified);

        if simplified.len() >= 3 {
            contours.push(Contour {
                vertices: simplified.clone(),
                region: span.region,
                area: chf.areas[si],
            });
        }
    }

    contours
}

/// Trace one region boundary clockwise, emitting a corner vertex for every
/// unconnected direction. Clears boundary flags as it consumes them.
fn walk_contour(
    mut cx: usize,
    mut cz: usize,
    mut si: usize,
    chf: &CompactHeightfield,
    boundary_flags: &mut [u8],
    out: &mut Vec<[i32; 4]>,
) {
    let mut dir = 0u8;
    while boundary_flags[si] & (1 << dir) == 0 {
        dir += 1;
    }
    let start = (cx, cz, si, dir);

    loop {
        let span = chf.spans[si];
        if boundary_flags[si] & (1 << dir) != 0 {
            let height = corner_height(cx, cz, &span, chf, dir);
            let px = cx as i32 + i32::from(dir == 1 || dir == 2);
            let pz = cz as i32 + i32::from(dir == 0 || dir == 1);
            let border_region = chf
                .connection(cx, cz, &span, dir as usize)
                .map(|ni| chf.spans[ni].region as i32)
                .unwrap_or(0);
            out.push([px, height as i32, pz, border_region]);

            boundary_flags[si] &= !(1 << dir);
            dir = (dir + 1) & 0x3; // rotate clockwise
        } else {
            let Some(ni) = chf.connection(cx, cz, &span, dir as usize) else {
                // Connected flag without a connection cannot happen for a
                // correctly built field; bail out of this outline.
                return;
            };
            let Some((nx, nz)) = chf.neighbour_cell(cx, cz, dir as usize) else {
                return;
            };
            si = ni;
            cx = nx;
            cz = nz;
            dir = (dir + 3) & 0x3; // rotate counter-clockwise
        }

        if (cx, cz, si, dir) == start {
            break;
        }
    }
}

/// Corner height: the highest floor among the spans meeting at this corner.
fn corner_height(
    cx: usize,
    cz: usize,
    span: &CompactSpan,
    chf: &CompactHeightfield,
    dir: u8,
) -> u16 {
    let next_dir = (dir + 1) & 0x3;
    let mut height = span.y;

    if let Some(ni) = chf.connection(cx, cz, span, dir as usize) {
        let nspan = chf.spans[ni];
        height = height.max(nspan.y);
        if let Some((nx, nz)) = chf.neighbour_cell(cx, cz, dir as usize) {
            if let Some(di) = chf.connection(nx, nz, &nspan, next_dir as usize) {
                height = height.max(chf.spans[di].y);
            }
        }
    }
    if let Some(ni) = chf.connection(cx, cz, span, next_dir as usize) {
        let nspan = chf.spans[ni];
        height = height.max(nspan.y);
        if let Some((nx, nz)) = chf.neighbour_cell(cx, cz, next_dir as usize) {
            if let Some(di) = chf.connection(nx, nz, &nspan, dir as usize) {
                height = height.max(chf.spans[di].y);
            }
        }
    }
    height
}

/// Keep structural vertices (border-region changes), then add detail back on
/// wall stretches until the outline deviates at most `max_error` cells and no
/// tessellated edge is longer than `max_edge_len` cells.
fn simplify_contour(
    points: &[[i32; 4]],
    simplified: &mut Vec<[i32; 4]>,
    max_error: f32,
    max_edge_len: i32,
) {
    let point_count = points.len();
    if point_count == 0 {
        return;
    }
    let has_connections = points.iter().any(|p| p[3] != 0);

    if has_connections {
        // Vertex at every border-region change; w records the source index.
        for i in 0..point_count {
            let next = (i + 1) % point_count;
            if points[i][3] != points[next][3] {
                simplified.push([points[i][0], points[i][1], points[i][2], i as i32]);
            }
        }
    } else {
        // Closed wall-only outline: seed with lower-left and upper-right.
        let mut lower_left = 0usize;
        let mut upper_right = 0usize;
        for (i, p) in points.iter().enumerate() {
            let ll = &points[lower_left];
            let ur = &points[upper_right];
            if p[0] < ll[0] || (p[0] == ll[0] && p[2] < ll[2]) {
                lower_left = i;
            }
            if p[0] > ur[0] || (p[0] == ur[0] && p[2] > ur[2]) {
                upper_right = i;
            }
        }
        let ll = points[lower_left];
        let ur = points[upper_right];
        simplified.push([ll[0], ll[1], ll[2], lower_left as i32]);
        simplified.push([ur[0], ur[1], ur[2], upper_right as i32]);
    }
    if simplified.is_empty() {
        return;
    }

    // Split segments at the farthest raw point until within tolerance.
    let max_error_sq = max_error * max_error;
    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();
        let mut a = simplified[i];
        let mut b = simplified[next];

        // Traverse raw points between a and b in ascending raw order.
        let (mut ci, increment, end) = if b[0] > a[0] || (b[0] == a[0] && b[2] > a[2]) {
            (
                (a[3] as usize + 1) % point_count,
                1usize,
                b[3] as usize,
            )
        } else {
            let inc = point_count - 1;
            std::mem::swap(&mut a, &mut b);
            (
                (a[3] as usize + inc) % point_count,
                inc,
                b[3] as usize,
            )
        };

        let mut max_deviation = 0.0f32;
        let mut worst: Option<usize> = None;

        // Only wall stretches get re-tessellated.
        if points[ci][3] == 0 {
            while ci != end {
                let deviation = point_segment_distance_sq(
                    points[ci][0] as f32,
                    points[ci][2] as f32,
                    a[0] as f32,
                    a[2] as f32,
                    b[0] as f32,
                    b[2] as f32,
                );
                if deviation > max_deviation {
                    max_deviation = deviation;
                    worst = Some(ci);
                }
                ci = (ci + increment) % point_count;
            }
        }

        match worst {
            Some(worst) if max_deviation > max_error_sq => {
                let p = points[worst];
                simplified.insert(i + 1, [p[0], p[1], p[2], worst as i32]);
            }
            _ => i += 1,
        }
    }

    // Split overly long wall edges at their midpoint raw vertex.
    if max_edge_len > 0 {
        let mut i = 0;
        while i < simplified.len() {
            let next = (i + 1) % simplified.len();
            let a = simplified[i];
            let b = simplified[next];

            let next_raw = (a[3] as usize + 1) % point_count;
            let mut split: Option<usize> = None;
            if points[next_raw][3] == 0 {
                let dx = b[0] - a[0];
                let dz = b[2] - a[2];
                if dx * dx + dz * dz > max_edge_len * max_edge_len {
                    let n = if b[3] < a[3] {
                        b[3] as isize + point_count as isize - a[3] as isize
                    } else {
                        b[3] as isize - a[3] as isize
                    };
                    if n > 1 {
                        split = if b[0] > a[0] || (b[0] == a[0] && b[2] > a[2]) {
                            Some((a[3] as usize + (n / 2) as usize) % point_count)
                        } else {
                            Some((a[3] as usize + ((n + 1) / 2) as usize) % point_count)
                        };
                    }
                }
            }

            match split {
                Some(mid) => {
                    let p = points[mid];
                    simplified.insert(i + 1, [p[0], p[1], p[2], mid as i32]);
                }
                None => i += 1,
            }
        }
    }

    // Replace the raw-index bookkeeping with the bordering region id.
    for vertex in simplified.iter_mut() {
        let next = (vertex[3] as usize + 1) % point_count;
        vertex[3] = points[next][3];
    }
}

fn point_segment_distance_sq(px: f32, pz: f32, ax: f32, az: f32, bx: f32, bz: f32) -> f32 {
    let dx = bx - ax;
    let dz = bz - az;
    let d = dx * dx + dz * dz;
    let mut t = dx * (px - ax) + dz * (pz - az);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let ex = ax + t * dx - px;
    let ez = az + t * dz - pz;
    ex * ex + ez * ez
}

/// Drop adjacent vertices equal on the XZ plane.
fn remove_degenerate_segments(simplified: &mut Vec<[i32; 4]>) {
    let mut i = 0;
    while i < simplified.len() && simplified.len() > 1 {
        let next = (i + 1) % simplified.len();
        if simplified[i][0] == simplified[next][0] && simplified[i][2] == simplified[next][2] {
            simplified.remove(next);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compact, region, test_geometry, voxel, TriangleInput};

    fn floor_contours(size: f32) -> (CompactHeightfield, Vec<Contour>) {
        let (positions, indices) = test_geometry::floor(size, 0.0);
        let input = TriangleInput {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let config = AgentConfig::default();
        let areas = crate::tag_triangles(&input, &config);
        let hf = voxel::rasterize(&input, &areas, &config).unwrap();
        let mut chf = compact::build_compact_heightfield(&hf, &config).unwrap();
        compact::erode_walkable_area(&mut chf, config.radius_cells());
        compact::build_distance_field(&mut chf);
        region::build_regions(&mut chf, 1, 4);
        let contours = build_contours(&chf, config.edge_max_err(), &config);
        (chf, contours)
    }

    #[test]
    fn floor_produces_closed_outlines() {
        let (chf, contours) = floor_contours(12.0);
        assert!(!contours.is_empty());
        for contour in &contours {
            assert!(contour.vertices.len() >= 3);
            assert!(contour.region >= 1 && contour.region <= chf.max_region);
            // All vertices inside the field.
            for v in &contour.vertices {
                assert!(v[0] >= 0 && v[0] <= chf.width as i32);
                assert!(v[2] >= 0 && v[2] <= chf.depth as i32);
            }
        }
    }

    #[test]
    fn long_edges_are_split() {
        let (_, contours) = floor_contours(20.0);
        let config = AgentConfig::default();
        let max_edge = (config.edge_max_len() / config.cell_size()) as i64;
        for contour in &contours {
            let n = contour.vertices.len();
            for i in 0..n {
                let a = contour.vertices[i];
                let b = contour.vertices[(i + 1) % n];
                // Wall edges only; edges bordering another region may be long.
                if a[3] == 0 {
                    let dx = (b[0] - a[0]) as i64;
                    let dz = (b[2] - a[2]) as i64;
                    assert!(
                        dx * dx + dz * dz <= max_edge * max_edge * 2,
                        "edge too long: {:?} -> {:?}",
                        a,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn degenerate_segments_removed() {
        let mut verts = vec![
            [0, 0, 0, 0],
            [0, 1, 0, 0], // same XZ as previous
            [4, 0, 0, 0],
            [4, 0, 4, 0],
        ];
        remove_degenerate_segments(&mut verts);
        assert_eq!(verts.len(), 3);
    }
}
