//! Solid heightfield rasterization and span filters.
//!
//! Triangles are clipped column-by-column into vertical spans of solid space.
//! The filters then reshape walkability the way an agent experiences it:
//! climbable clutter is promoted, ledges and too-low headroom are removed.

use glam::Vec3;
use skarn_geom::Aabb;
use tracing::debug;

use crate::{AgentConfig, TriangleInput, NULL_AREA};

/// Cardinal neighbour offsets, shared with the compact heightfield:
/// 0: (-1, 0), 1: (0, 1), 2: (1, 0), 3: (0, -1).
pub(crate) const DIRS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

/// One solid span in a column, in voxel units. `max` is the walkable floor
/// candidate (top of solid).
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Span {
    pub min: u16,
    pub max: u16,
    pub area: u8,
}

pub(crate) struct Heightfield {
    pub width: usize,
    pub depth: usize,
    /// Vertical voxel count covered by the bounds.
    pub height: u16,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    /// `width * depth` columns, spans sorted by `min`.
    pub columns: Vec<Vec<Span>>,
}

impl Heightfield {
    pub fn column_index(&self, cx: usize, cz: usize) -> usize {
        cx + cz * self.width
    }
}

/// Rasterize the tagged soup. Returns `None` when nothing solid lands in the
/// field (no bounds, all triangles degenerate).
pub(crate) fn rasterize(
    input: &TriangleInput,
    areas: &[u8],
    config: &AgentConfig,
) -> Option<Heightfield> {
    let mut bounds = Aabb::EMPTY;
    for i in 0..input.triangle_count() {
        let [a, b, c] = input.triangle(i);
        bounds.insert(a);
        bounds.insert(b);
        bounds.insert(c);
    }
    if bounds.is_empty() {
        return None;
    }
    let bounds = bounds.expand_vertical(config.cell_height(), 2.0 * config.height);

    let cs = config.cell_size();
    let ch = config.cell_height();
    let width = ((bounds.max.x - bounds.min.x) / cs).ceil().max(1.0) as usize;
    let depth = ((bounds.max.z - bounds.min.z) / cs).ceil().max(1.0) as usize;
    let height = (((bounds.max.y - bounds.min.y) / ch).ceil() as u32).min(u16::MAX as u32) as u16;

    let mut hf = Heightfield {
        width,
        depth,
        height,
        bmin: bounds.min,
        bmax: bounds.max,
        cell_size: cs,
        cell_height: ch,
        columns: vec![Vec::new(); width * depth],
    };

    let mut rasterized = 0usize;
    for i in 0..input.triangle_count() {
        let tri = input.triangle(i);
        if skarn_geom::Triangle::new(tri[0], tri[1], tri[2]).is_degenerate() {
            continue;
        }
        rasterize_triangle(&mut hf, tri, areas[i], config.climb_cells());
        rasterized += 1;
    }
    debug!(
        width,
        depth,
        triangles = rasterized,
        "rasterized solid heightfield"
    );
    if rasterized == 0 || hf.columns.iter().all(|c| c.is_empty()) {
        return None;
    }
    Some(hf)
}

/// Split a convex polygon by an axis-aligned plane. `below` keeps the part
/// with coordinate <= `offset`, `above` the rest.
fn divide_poly(
    input: &[Vec3],
    axis: usize,
    offset: f32,
    below: &mut Vec<Vec3>,
    above: &mut Vec<Vec3>,
) {
    below.clear();
    above.clear();
    let n = input.len();
    for i in 0..n {
        let j = (i + n - 1) % n;
        let di = offset - input[i][axis];
        let dj = offset - input[j][axis];
        if (di >= 0.0) != (dj >= 0.0) {
            let s = dj / (dj - di);
            let v = input[j] + (input[i] - input[j]) * s;
            below.push(v);
            above.push(v);
        }
        if di > 0.0 {
            below.push(input[i]);
        } else if di < 0.0 {
            above.push(input[i]);
        } else {
            below.push(input[i]);
            above.push(input[i]);
        }
    }
}

fn rasterize_triangle(hf: &mut Heightfield, tri: [Vec3; 3], area: u8, merge_threshold: u16) {
    let tri_aabb = Aabb::from_points(tri);
    let field_aabb = Aabb::new(hf.bmin, hf.bmax);
    if !tri_aabb.overlaps(&field_aabb) {
        return;
    }

    let cs = hf.cell_size;
    let ics = 1.0 / cs;
    let ich = 1.0 / hf.cell_height;

    let z0 = (((tri_aabb.min.z - hf.bmin.z) * ics).floor() as i64).clamp(-1, hf.depth as i64 - 1);
    let z1 = (((tri_aabb.max.z - hf.bmin.z) * ics).floor() as i64).clamp(0, hf.depth as i64 - 1);

    let mut remaining: Vec<Vec3> = tri.to_vec();
    let mut row = Vec::with_capacity(7);
    let mut next = Vec::with_capacity(7);
    let mut cell = Vec::with_capacity(7);
    let mut row_rest = Vec::with_capacity(7);

    for z in z0..=z1 {
        let row_top = hf.bmin.z + (z + 1) as f32 * cs;
        divide_poly(&remaining, 2, row_top, &mut row, &mut next);
        std::mem::swap(&mut remaining, &mut next);
        if row.len() < 3 || z < 0 {
            continue;
        }

        let row_min_x = row.iter().map(|v| v.x).fold(f32::INFINITY, f32::min);
        let row_max_x = row.iter().map(|v| v.x).fold(f32::NEG_INFINITY, f32::max);
        let x0 = (((row_min_x - hf.bmin.x) * ics).floor() as i64).clamp(-1, hf.width as i64 - 1);
        let x1 = (((row_max_x - hf.bmin.x) * ics).floor() as i64).clamp(0, hf.width as i64 - 1);

        let mut in_row = row.clone();
        for x in x0..=x1 {
            let col_right = hf.bmin.x + (x + 1) as f32 * cs;
            divide_poly(&in_row, 0, col_right, &mut cell, &mut row_rest);
            std::mem::swap(&mut in_row, &mut row_rest);
            if cell.len() < 3 || x < 0 {
                continue;
            }

            let y_min = cell.iter().map(|v| v.y).fold(f32::INFINITY, f32::min) - hf.bmin.y;
            let y_max = cell.iter().map(|v| v.y).fold(f32::NEG_INFINITY, f32::max) - hf.bmin.y;
            if y_max < 0.0 || y_min > (hf.height as f32) * hf.cell_height {
                continue;
            }

            let smin = ((y_min * ich).floor().max(0.0) as u32).min(hf.height as u32 - 1) as u16;
            let smax = (((y_max * ich).ceil() as u32).max(smin as u32 + 1))
                .min(hf.height as u32) as u16;
            let column = hf.column_index(x as usize, z as usize);
            add_span(&mut hf.columns[column], smin, smax, area, merge_threshold);
        }
    }
}

/// Insert a span into a sorted column, merging overlaps. When merged tops are
/// within `merge_threshold` cells the higher-priority area wins.
fn add_span(column: &mut Vec<Span>, min: u16, max: u16, area: u8, merge_threshold: u16) {
    let mut new = Span { min, max, area };
    let mut i = 0;
    while i < column.len() {
        let cur = column[i];
        if cur.min > new.max {
            break;
        }
        if cur.max < new.min {
            i += 1;
            continue;
        }
        // Overlap: merge and keep scanning from the same slot.
        if (cur.max as i32 - new.max as i32).abs() <= merge_threshold as i32 {
            new.area = new.area.max(cur.area);
        } else if cur.max > new.max {
            new.area = cur.area;
        }
        new.min = new.min.min(cur.min);
        new.max = new.max.max(cur.max);
        column.remove(i);
    }
    column.insert(i, new);
}

fn walkable(span: &Span) -> bool {
    span.area != NULL_AREA
}

/// Unwalkable spans resting within climb distance on top of a walkable span
/// become walkable: stairs, rubble, and other low clutter.
pub(crate) fn filter_low_hanging_obstacles(hf: &mut Heightfield, climb_cells: u16) {
    for column in hf.columns.iter_mut() {
        let mut previous: Option<Span> = None;
        for span in column.iter_mut() {
            if let Some(prev) = previous {
                if !walkable(span)
                    && walkable(&prev)
                    && (span.max as i32 - prev.max as i32).abs() <= climb_cells as i32
                {
                    span.area = prev.area;
                }
            }
            previous = Some(*span);
        }
    }
}

/// Remove walkable spans that sit on a ledge: any neighbour column drops
/// further than the climb limit, or the accessible neighbour floors span more
/// than the climb limit (too steep to stand on).
pub(crate) fn filter_ledge_spans(hf: &mut Heightfield, height_cells: u16, climb_cells: u16) {
    let height_i = height_cells as i32;
    let climb_i = climb_cells as i32;
    let max_height = i32::MAX;

    for cz in 0..hf.depth {
        for cx in 0..hf.width {
            let column = hf.column_index(cx, cz);
            for si in 0..hf.columns[column].len() {
                let span = hf.columns[column][si];
                if !walkable(&span) {
                    continue;
                }
                let bot = span.max as i32;
                let top = hf.columns[column]
                    .get(si + 1)
                    .map(|s| s.min as i32)
                    .unwrap_or(max_height);

                let mut min_drop = max_height;
                let mut accessible_min = span.max as i32;
                let mut accessible_max = span.max as i32;

                for (dx, dz) in DIRS {
                    let nx = cx as i32 + dx;
                    let nz = cz as i32 + dz;
                    if nx < 0 || nz < 0 || nx >= hf.width as i32 || nz >= hf.depth as i32 {
                        // Outside the field counts as a bottomless drop.
                        min_drop = min_drop.min(-climb_i - 1);
                        continue;
                    }
                    let neighbour = &hf.columns[hf.column_index(nx as usize, nz as usize)];

                    // Virtual floor below the first neighbour span.
                    let mut nbot = -climb_i - 1;
                    let mut ntop = neighbour.first().map(|s| s.min as i32).unwrap_or(max_height);
                    if top.min(ntop) - bot.max(nbot) > height_i {
                        min_drop = min_drop.min(nbot - bot);
                    }

                    for (ni, nspan) in neighbour.iter().enumerate() {
                        nbot = nspan.max as i32;
                        ntop = neighbour
                            .get(ni + 1)
                            .map(|s| s.min as i32)
                            .unwrap_or(max_height);
                        if top.min(ntop) - bot.max(nbot) > height_i {
                            min_drop = min_drop.min(nbot - bot);
                            if (nbot - bot).abs() <= climb_i {
                                accessible_min = accessible_min.min(nbot);
                                accessible_max = accessible_max.max(nbot);
                            }
                        }
                    }
                }

                if min_drop < -climb_i || (accessible_max - accessible_min) > climb_i {
                    hf.columns[column][si].area = NULL_AREA;
                }
            }
        }
    }
}

/// Remove spans whose headroom is below the agent height.
pub(crate) fn filter_low_height_spans(hf: &mut Heightfield, height_cells: u16) {
    for column in hf.columns.iter_mut() {
        for si in 0..column.len() {
            let ceiling = column
                .get(si + 1)
                .map(|s| s.min as i32)
                .unwrap_or(i32::MAX);
            if ceiling - column[si].max as i32 <= height_cells as i32 {
                column[si].area = NULL_AREA;
            }
        }
    }
}
