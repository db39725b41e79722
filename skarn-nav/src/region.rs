//! Watershed partitioning of the compact heightfield into regions.
//!
//! Regions flood outward from distance-field peaks, two distance levels at a
//! time; leftover spans are claimed by the final expansion. Small regions are
//! merged into neighbours so the mesher never sees slivers. Region ids are
//! compressed to `1..=max_region`; 0 stays "no region".

use tracing::debug;

use crate::compact::CompactHeightfield;
use crate::NULL_AREA;

const EXPAND_ITERS: usize = 8;

pub(crate) fn build_regions(
    chf: &mut CompactHeightfield,
    min_region_size: usize,
    merge_region_size: usize,
) {
    let span_count = chf.spans.len();
    let mut regions = vec![0u16; span_count];
    let mut next_region: u16 = 1;

    let mut level = (chf.max_distance + 1) & !1;
    while level > 0 {
        level = level.saturating_sub(2);

        expand_regions(chf, &mut regions, level, EXPAND_ITERS);

        // Seed new regions from still-unclaimed spans at this water level.
        let seeds: Vec<(usize, usize, usize)> = chf
            .iter_spans()
            .filter(|&(_, _, si)| {
                regions[si] == 0 && chf.dist[si] >= level && chf.areas[si] != NULL_AREA
            })
            .collect();
        for (cx, cz, si) in seeds {
            if regions[si] != 0 {
                continue;
            }
            flood_region(chf, &mut regions, cx, cz, si, level, next_region);
            next_region = next_region.saturating_add(1);
        }
    }

    // Claim whatever the level sweep left behind.
    expand_regions(chf, &mut regions, 0, usize::MAX);

    let max_region = merge_and_compress(
        chf,
        &mut regions,
        next_region,
        min_region_size,
        merge_region_size,
    );

    for (si, span) in chf.spans.iter_mut().enumerate() {
        span.region = regions[si];
    }
    chf.max_region = max_region;
    debug!(regions = max_region, "built watershed regions");
}

/// Grow existing regions onto unclaimed spans whose distance is at least
/// `level`. Runs until stable or `max_iterations`.
fn expand_regions(
    chf: &CompactHeightfield,
    regions: &mut [u16],
    level: u16,
    max_iterations: usize,
) {
    let mut pending: Vec<(usize, usize, usize)> = chf
        .iter_spans()
        .filter(|&(_, _, si)| {
            regions[si] == 0 && chf.dist[si] >= level && chf.areas[si] != NULL_AREA
        })
        .collect();

    let mut iter = 0;
    while !pending.is_empty() {
        // Two phases per iteration: decide claims against a stable snapshot,
        // then apply, so iteration order cannot leak into the result.
        let mut claims: Vec<(usize, u16)> = Vec::new();
        let mut next_pending = Vec::with_capacity(pending.len());

        for &(cx, cz, si) in &pending {
            let span = chf.spans[si];
            let area = chf.areas[si];
            let mut best: Option<(u16, u16)> = None; // (region, neighbour dist)
            for dir in 0..4 {
                let Some(ni) = chf.connection(cx, cz, &span, dir) else {
                    continue;
                };
                if chf.areas[ni] != area {
                    continue;
                }
                let region = regions[ni];
                if region == 0 {
                    continue;
                }
                let candidate = (region, chf.dist[ni]);
                best = Some(match best {
                    Some(current) if current.1 <= candidate.1 => current,
                    _ => candidate,
                });
            }
            match best {
                Some((region, _)) => claims.push((si, region)),
                None => next_pending.push((cx, cz, si)),
            }
        }

        if claims.is_empty() {
            break;
        }
        for &(si, region) in &claims {
            regions[si] = region;
        }
        pending = next_pending;

        iter += 1;
        if iter >= max_iterations {
            break;
        }
    }
}

/// Flood-fill one new region over connected spans at or above the level.
fn flood_region(
    chf: &CompactHeightfield,
    regions: &mut [u16],
    cx: usize,
    cz: usize,
    si: usize,
    level: u16,
    region_id: u16,
) {
    let area = chf.areas[si];
    let mut stack = vec![(cx, cz, si)];
    regions[si] = region_id;

    while let Some((cx, cz, si)) = stack.pop() {
        let span = chf.spans[si];
        for dir in 0..4 {
            let Some(ni) = chf.connection(cx, cz, &span, dir) else {
                continue;
            };
            if regions[ni] != 0 || chf.areas[ni] != area || chf.dist[ni] < level {
                continue;
            }
            let Some((nx, nz)) = chf.neighbour_cell(cx, cz, dir) else {
                continue;
            };
            regions[ni] = region_id;
            stack.push((nx, nz, ni));
        }
    }
}

/// Merge small regions into connected neighbours, drop regions below the
/// minimum size, and compress ids to be consecutive from 1.
fn merge_and_compress(
    chf: &CompactHeightfield,
    regions: &mut [u16],
    region_count: u16,
    min_region_size: usize,
    merge_region_size: usize,
) -> u16 {
    let count = region_count as usize;
    let mut sizes = vec![0usize; count];
    let mut areas = vec![NULL_AREA; count];
    for (si, &region) in regions.iter().enumerate() {
        if region != 0 {
            sizes[region as usize] += 1;
            areas[region as usize] = chf.areas[si];
        }
    }

    // Region adjacency from span connections.
    let mut neighbours: Vec<Vec<u16>> = vec![Vec::new(); count];
    for (cx, cz, si) in chf.iter_spans() {
        let region = regions[si];
        if region == 0 {
            continue;
        }
        let span = chf.spans[si];
        for dir in 0..4 {
            let Some(ni) = chf.connection(cx, cz, &span, dir) else {
                continue;
            };
            let other = regions[ni];
            if other != 0 && other != region && !neighbours[region as usize].contains(&other) {
                neighbours[region as usize].push(other);
            }
        }
    }

    // Iteratively fold small regions into their smallest same-area neighbour.
    let mut remap: Vec<u16> = (0..count as u16).collect();
    let resolve = |remap: &[u16], mut r: u16| {
        while remap[r as usize] != r {
            r = remap[r as usize];
        }
        r
    };

    loop {
        let mut merged_any = false;
        for r in 1..count as u16 {
            if resolve(&remap, r) != r || sizes[r as usize] == 0 {
                continue;
            }
            if sizes[r as usize] > merge_region_size {
                continue;
            }
            let target = neighbours[r as usize]
                .iter()
                .map(|&n| resolve(&remap, n))
                .filter(|&n| n != r && sizes[n as usize] > 0 && areas[n as usize] == areas[r as usize])
                .min_by_key(|&n| (sizes[n as usize], n));
            if let Some(target) = target {
                sizes[target as usize] += sizes[r as usize];
                sizes[r as usize] = 0;
                remap[r as usize] = target;
                let extra: Vec<u16> = neighbours[r as usize].clone();
                for n in extra {
                    let n = resolve(&remap, n);
                    if n != target && !neighbours[target as usize].contains(&n) {
                        neighbours[target as usize].push(n);
                    }
                }
                merged_any = true;
            }
        }
        if !merged_any {
            break;
        }
    }

    // Drop undersized survivors.
    for r in 1..count as u16 {
        if resolve(&remap, r) == r && sizes[r as usize] < min_region_size {
            sizes[r as usize] = 0;
        }
    }

    // Compress ids.
    let mut compressed = vec![0u16; count];
    let mut next = 0u16;
    for r in 1..count as u16 {
        if resolve(&remap, r) == r && sizes[r as usize] > 0 {
            next += 1;
            compressed[r as usize] = next;
        }
    }

    for region in regions.iter_mut() {
        if *region != 0 {
            *region = compressed[resolve(&remap, *region) as usize];
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact;
    use crate::{test_geometry, voxel, AgentConfig, TriangleInput, WALKABLE_AREA};

    fn partitioned_floor(size: f32) -> CompactHeightfield {
        let (positions, indices) = test_geometry::gridded_floor(size, 0.0, 8);
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
        build_regions(&mut chf, 1, 4);
        chf
    }

    #[test]
    fn every_walkable_span_gets_a_region() {
        let chf = partitioned_floor(12.0);
        assert!(chf.max_region >= 1);
        for (_, _, si) in chf.iter_spans() {
            if chf.areas[si] == WALKABLE_AREA {
                assert_ne!(chf.spans[si].region, 0);
            } else {
                assert_eq!(chf.spans[si].region, 0);
            }
        }
    }

    #[test]
    fn region_ids_are_compressed() {
        let chf = partitioned_floor(12.0);
        let mut seen = vec![false; chf.max_region as usize + 1];
        for (_, _, si) in chf.iter_spans() {
            let region = chf.spans[si].region;
            assert!(region <= chf.max_region);
            seen[region as usize] = true;
        }
        for (id, seen) in seen.iter().enumerate().skip(1) {
            assert!(*seen, "region id {id} unused");
        }
    }

    #[test]
    fn open_floor_is_one_or_few_regions() {
        let chf = partitioned_floor(12.0);
        // A flat open floor should not shatter into many regions.
        assert!(chf.max_region <= 8, "got {} regions", chf.max_region);
    }
}
