//! Compact (open) heightfield: walkable floor spans with 4-neighbour
//! connectivity, walkable-radius erosion, and the boundary distance field the
//! watershed partitioner runs on.

use glam::Vec3;
use tracing::debug;

use crate::voxel::{Heightfield, DIRS};
use crate::{AgentConfig, NULL_AREA};

const OPEN_CEILING: u16 = u16::MAX;

#[derive(Clone, Copy, Debug)]
pub(crate) struct CompactSpan {
    /// Floor height in voxels.
    pub y: u16,
    /// Ceiling height in voxels; `OPEN_CEILING` when nothing is above.
    pub ceiling: u16,
    /// Per-direction index of the connected span within the neighbour cell.
    pub connections: [Option<u8>; 4],
    pub region: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CompactCell {
    pub first: u32,
    pub count: u32,
}

pub(crate) struct CompactHeightfield {
    pub width: usize,
    pub depth: usize,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cell_size: f32,
    pub cell_height: f32,
    pub cells: Vec<CompactCell>,
    pub spans: Vec<CompactSpan>,
    /// Area id per span, parallel to `spans`.
    pub areas: Vec<u8>,
    pub dist: Vec<u16>,
    pub max_distance: u16,
    pub max_region: u16,
}

impl CompactHeightfield {
    pub fn cell_index(&self, cx: usize, cz: usize) -> usize {
        cx + cz * self.width
    }

    /// Neighbour cell index in `dir`, if inside the field.
    pub fn neighbour_cell(&self, cx: usize, cz: usize, dir: usize) -> Option<(usize, usize)> {
        let nx = cx as i32 + DIRS[dir].0;
        let nz = cz as i32 + DIRS[dir].1;
        if nx < 0 || nz < 0 || nx >= self.width as i32 || nz >= self.depth as i32 {
            None
        } else {
            Some((nx as usize, nz as usize))
        }
    }

    /// Global span index of the connection of `span` in `dir`.
    pub fn connection(&self, cx: usize, cz: usize, span: &CompactSpan, dir: usize) -> Option<usize> {
        let local = span.connections[dir]?;
        let (nx, nz) = self.neighbour_cell(cx, cz, dir)?;
        let cell = self.cells[self.cell_index(nx, nz)];
        Some(cell.first as usize + local as usize)
    }

    /// Iterate `(cx, cz, global_span_index)` in row-major, floor-ascending
    /// order.
    pub fn iter_spans(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.depth).flat_map(move |cz| {
            (0..self.width).flat_map(move |cx| {
                let cell = self.cells[self.cell_index(cx, cz)];
                (cell.first as usize..(cell.first + cell.count) as usize)
                    .map(move |si| (cx, cz, si))
            })
        })
    }
}

/// Convert the solid heightfield into open floor spans and connect
/// neighbours the agent can step between.
pub(crate) fn build_compact_heightfield(
    hf: &Heightfield,
    config: &AgentConfig,
) -> Option<CompactHeightfield> {
    let walkable_height = config.height_cells() as i32;
    let walkable_climb = config.climb_cells() as i32;

    let mut cells = vec![CompactCell::default(); hf.width * hf.depth];
    let mut spans = Vec::new();
    let mut areas = Vec::new();

    for cz in 0..hf.depth {
        for cx in 0..hf.width {
            let column = &hf.columns[hf.column_index(cx, cz)];
            let first = spans.len() as u32;
            for (si, span) in column.iter().enumerate() {
                if span.area == NULL_AREA {
                    continue;
                }
                let ceiling = column
                    .get(si + 1)
                    .map(|s| s.min)
                    .unwrap_or(OPEN_CEILING);
                spans.push(CompactSpan {
                    y: span.max,
                    ceiling,
                    connections: [None; 4],
                    region: 0,
                });
                areas.push(span.area);
            }
            let cell = &mut cells[cx + cz * hf.width];
            cell.first = first;
            cell.count = spans.len() as u32 - first;
        }
    }

    if spans.is_empty() {
        return None;
    }

    let mut chf = CompactHeightfield {
        width: hf.width,
        depth: hf.depth,
        bmin: hf.bmin,
        bmax: hf.bmax,
        cell_size: hf.cell_size,
        cell_height: hf.cell_height,
        cells,
        spans,
        areas,
        dist: Vec::new(),
        max_distance: 0,
        max_region: 0,
    };

    // Connectivity: a neighbour is reachable when the floor step is within
    // climb and the shared headroom fits the agent.
    for cz in 0..chf.depth {
        for cx in 0..chf.width {
            let cell = chf.cells[chf.cell_index(cx, cz)];
            for si in cell.first as usize..(cell.first + cell.count) as usize {
                let span = chf.spans[si];
                let mut connections = [None; 4];
                for (dir, slot) in connections.iter_mut().enumerate() {
                    let Some((nx, nz)) = chf.neighbour_cell(cx, cz, dir) else {
                        continue;
                    };
                    let ncell = chf.cells[chf.cell_index(nx, nz)];
                    for local in 0..ncell.count as usize {
                        let nspan = chf.spans[ncell.first as usize + local];
                        let bot = span.y.max(nspan.y) as i32;
                        let top = span.ceiling.min(nspan.ceiling) as i32;
                        if top - bot >= walkable_height
                            && (nspan.y as i32 - span.y as i32).abs() <= walkable_climb
                            && local <= u8::MAX as usize
                        {
                            *slot = Some(local as u8);
                            break;
                        }
                    }
                }
                chf.spans[si].connections = connections;
            }
        }
    }

    debug!(spans = chf.spans.len(), "built compact heightfield");
    Some(chf)
}

/// Two-pass chamfer distance from boundary spans. `is_boundary` decides which
/// spans seed at distance zero.
fn chamfer_distance(
    chf: &CompactHeightfield,
    mut is_boundary: impl FnMut(&CompactHeightfield, usize, usize, usize) -> bool,
) -> Vec<u16> {
    let mut dist = vec![u16::MAX; chf.spans.len()];

    for (cx, cz, si) in chf.iter_spans() {
        if is_boundary(chf, cx, cz, si) {
            dist[si] = 0;
        }
    }

    // Forward pass: west/south neighbours and their diagonals.
    for cz in 0..chf.depth {
        for cx in 0..chf.width {
            let cell = chf.cells[chf.cell_index(cx, cz)];
            for si in cell.first as usize..(cell.first + cell.count) as usize {
                let span = chf.spans[si];
                for (dir, diag_dir) in [(0usize, 3usize), (3, 2)] {
                    let Some(ni) = chf.connection(cx, cz, &span, dir) else {
                        continue;
                    };
                    dist[si] = dist[si].min(dist[ni].saturating_add(2));
                    let (nx, nz) = match chf.neighbour_cell(cx, cz, dir) {
                        Some(c) => c,
                        None => continue,
                    };
                    if let Some(di) = chf.connection(nx, nz, &chf.spans[ni], diag_dir) {
                        dist[si] = dist[si].min(dist[di].saturating_add(3));
                    }
                }
            }
        }
    }

    // Reverse pass: east/north neighbours and their diagonals.
    for cz in (0..chf.depth).rev() {
        for cx in (0..chf.width).rev() {
            let cell = chf.cells[chf.cell_index(cx, cz)];
            for si in cell.first as usize..(cell.first + cell.count) as usize {
                let span = chf.spans[si];
                for (dir, diag_dir) in [(2usize, 1usize), (1, 0)] {
                    let Some(ni) = chf.connection(cx, cz, &span, dir) else {
                        continue;
                    };
                    dist[si] = dist[si].min(dist[ni].saturating_add(2));
                    let (nx, nz) = match chf.neighbour_cell(cx, cz, dir) {
                        Some(c) => c,
                        None => continue,
                    };
                    if let Some(di) = chf.connection(nx, nz, &chf.spans[ni], diag_dir) {
                        dist[si] = dist[si].min(dist[di].saturating_add(3));
                    }
                }
            }
        }
    }

    dist
}

/// Pull the walkable area back from walls by the agent radius. Distances are
/// in half-cells (a step to a cardinal neighbour counts 2).
pub(crate) fn erode_walkable_area(chf: &mut CompactHeightfield, radius_cells: u16) {
    let dist = chamfer_distance(chf, |chf, cx, cz, si| {
        let span = chf.spans[si];
        if chf.areas[si] == NULL_AREA {
            return true;
        }
        (0..4).any(|dir| match chf.connection(cx, cz, &span, dir) {
            Some(ni) => chf.areas[ni] == NULL_AREA,
            None => true,
        })
    });

    let threshold = radius_cells as u16 * 2;
    let mut eroded = 0usize;
    for (si, area) in chf.areas.iter_mut().enumerate() {
        if dist[si] < threshold && *area != NULL_AREA {
            *area = NULL_AREA;
            eroded += 1;
        }
    }
    debug!(eroded, "eroded walkable area");
}

/// Distance-to-boundary field used to seed watershed regions.
pub(crate) fn build_distance_field(chf: &mut CompactHeightfield) {
    let dist = chamfer_distance(chf, |chf, cx, cz, si| {
        let span = chf.spans[si];
        if chf.areas[si] == NULL_AREA {
            return true;
        }
        (0..4).any(|dir| match chf.connection(cx, cz, &span, dir) {
            Some(ni) => chf.areas[ni] != chf.areas[si],
            None => true,
        })
    });

    chf.max_distance = dist
        .iter()
        .zip(chf.areas.iter())
        .filter(|(_, area)| **area != NULL_AREA)
        .map(|(d, _)| *d)
        .max()
        .unwrap_or(0);
    chf.dist = dist;
}
