//! Navigation-mesh construction and path planning.
//!
//! [`build_navmesh`] turns a triangle soup into an immutable [`NavMesh`]
//! through a voxel pipeline: solid heightfield, span filters, compact
//! heightfield with erosion and a distance field, watershed regions, simplified
//! contours, a convex polygon mesh, and a per-polygon detail mesh for accurate
//! surface heights. [`NavMeshQuery`] then answers nearest-polygon snaps, A*
//! path searches with funnel string pulling, and path validation against the
//! agent's climb and slope limits.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

mod compact;
mod contour;
mod detail;
mod mesher;
mod navmesh;
mod query;
mod region;
mod validate;
mod voxel;

pub use navmesh::{NavMesh, Polygon};
pub use query::{NavMeshQuery, Path, PolyRef};
pub use validate::{
    find_bridge_artefact, likely_bridge_artefact, try_fix_path, validate_path, SegmentViolation,
};

/// Area id assigned to walkable surface.
pub const WALKABLE_AREA: u8 = 63;
/// Area id for unwalkable space.
pub const NULL_AREA: u8 = 0;
/// Polygon flag bit set on walkable polygons.
pub const WALKABLE_FLAG: u16 = 0x01;

/// Maximum vertices per navmesh polygon.
pub const VERTS_PER_POLY: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum NavError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("no position on the navmesh within the search extents")]
    NotOnNavMesh,
    #[error("no polygon corridor between start and goal")]
    NoPath,
    #[error("path segment {segment_index} is untraversable: {reason}")]
    PathInvalid { reason: String, segment_index: usize },
    #[error("build produced no walkable polygons")]
    EmptyNavMesh,
}

/// Agent traversability limits, shared by the builder, the planner, and the
/// movement layer. The voxel parameters are derived from the agent radius so
/// all three stay consistent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub height: f32,
    pub radius: f32,
    pub max_slope_deg: f32,
    /// Largest traversable vertical step, in meters.
    pub max_climb: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            height: 1.8,
            radius: 0.5,
            max_slope_deg: 45.0,
            max_climb: 0.4,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), NavError> {
        let finite = self.height.is_finite()
            && self.radius.is_finite()
            && self.max_slope_deg.is_finite()
            && self.max_climb.is_finite();
        if !finite || self.height <= 0.0 || self.radius <= 0.0 || self.max_climb < 0.0 {
            return Err(NavError::InvalidParameter(
                "agent height/radius must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Horizontal voxel resolution.
    pub fn cell_size(&self) -> f32 {
        self.radius / 2.0
    }

    /// Vertical voxel resolution.
    pub fn cell_height(&self) -> f32 {
        self.cell_size() / 2.0
    }

    /// Contour edges longer than this are split, in meters.
    pub fn edge_max_len(&self) -> f32 {
        self.radius * 8.0
    }

    /// Maximum contour simplification deviation, in cells.
    pub fn edge_max_err(&self) -> f32 {
        1.3
    }

    pub fn detail_sample_dist(&self) -> f32 {
        self.cell_size() * 6.0
    }

    pub fn detail_sample_max_err(&self) -> f32 {
        self.cell_height()
    }

    /// Agent height in (vertical) voxel cells, rounded up.
    pub(crate) fn height_cells(&self) -> u16 {
        (self.height / self.cell_height()).ceil() as u16
    }

    pub(crate) fn climb_cells(&self) -> u16 {
        (self.max_climb / self.cell_height()).floor() as u16
    }

    pub(crate) fn radius_cells(&self) -> u16 {
        (self.radius / self.cell_size()).ceil() as u16
    }
}

/// Triangle soup input: flat position triples, index triples, optional
/// per-triangle area tags (`WALKABLE_AREA` or `NULL_AREA`). Without tags,
/// triangles are tagged by slope against the agent's limit.
#[derive(Clone, Copy, Debug)]
pub struct TriangleInput<'a> {
    pub positions: &'a [f32],
    pub indices: &'a [u32],
    pub areas: Option<&'a [u8]>,
}

impl<'a> TriangleInput<'a> {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub(crate) fn triangle(&self, i: usize) -> [Vec3; 3] {
        let idx = &self.indices[i * 3..i * 3 + 3];
        let v = |j: u32| {
            let p = &self.positions[j as usize * 3..j as usize * 3 + 3];
            Vec3::new(p[0], p[1], p[2])
        };
        [v(idx[0]), v(idx[1]), v(idx[2])]
    }
}

/// Tags every triangle walkable/unwalkable. Caller tags win; untagged soup is
/// tagged by slope.
pub fn tag_triangles(input: &TriangleInput, config: &AgentConfig) -> Vec<u8> {
    if let Some(areas) = input.areas {
        return areas.to_vec();
    }
    let walkable_cos = config.max_slope_deg.to_radians().cos();
    let mut areas = vec![NULL_AREA; input.triangle_count()];
    for (i, area) in areas.iter_mut().enumerate() {
        let [a, b, c] = input.triangle(i);
        let normal = (b - a).cross(c - a).normalize_or_zero();
        if normal.y >= walkable_cos {
            *area = WALKABLE_AREA;
        }
    }
    areas
}

/// Occlusion pre-pass: a walkable triangle lying entirely within the XZ
/// footprint and vertical span of an unwalkable triangle is re-tagged
/// unwalkable. This removes ghost floors underneath wall geometry. O(T²) with
/// an AABB early-out; fine for the hundreds-to-thousands of triangles a world
/// chunk carries.
pub fn filter_occluded_triangles(input: &TriangleInput, areas: &mut [u8]) {
    use skarn_geom::{Aabb, Triangle};

    let tris: Vec<Triangle> = (0..input.triangle_count())
        .map(|i| {
            let [a, b, c] = input.triangle(i);
            Triangle::new(a, b, c)
        })
        .collect();
    let aabbs: Vec<Aabb> = tris.iter().map(|t| t.aabb()).collect();

    let mut retagged = 0usize;
    for i in 0..tris.len() {
        if areas[i] != WALKABLE_AREA {
            continue;
        }
        for j in 0..tris.len() {
            if i == j || areas[j] == WALKABLE_AREA {
                continue;
            }
            let (w, u) = (&aabbs[i], &aabbs[j]);
            if !w.overlaps_xz(u) {
                continue;
            }
            let inside_footprint = w.min.x >= u.min.x
                && w.max.x <= u.max.x
                && w.min.z >= u.min.z
                && w.max.z <= u.max.z;
            let inside_span = w.min.y >= u.min.y - 1e-4 && w.max.y <= u.max.y + 1e-4;
            if inside_footprint && inside_span {
                areas[i] = NULL_AREA;
                retagged += 1;
                break;
            }
        }
    }
    if retagged > 0 {
        debug!(retagged, "occlusion filter re-tagged triangles");
    }
}

/// Builds the queryable navmesh. Fails with [`NavError::EmptyNavMesh`] when
/// any stage produces no walkable output; partial meshes are never returned.
pub fn build_navmesh(input: &TriangleInput, config: &AgentConfig) -> Result<NavMesh, NavError> {
    config.validate()?;
    if input.positions.len() % 3 != 0 || input.indices.len() % 3 != 0 {
        return Err(NavError::InvalidParameter(
            "positions and indices must be triples",
        ));
    }
    if let Some(areas) = input.areas {
        if areas.len() != input.triangle_count() {
            return Err(NavError::InvalidParameter(
                "one area tag per triangle required",
            ));
        }
    }

    let areas = tag_triangles(input, config);

    let mut heightfield =
        voxel::rasterize(input, &areas, config).ok_or(NavError::EmptyNavMesh)?;
    voxel::filter_low_hanging_obstacles(&mut heightfield, config.climb_cells());
    voxel::filter_ledge_spans(&mut heightfield, config.height_cells(), config.climb_cells());
    voxel::filter_low_height_spans(&mut heightfield, config.height_cells());

    let mut chf = compact::build_compact_heightfield(&heightfield, config)
        .ok_or(NavError::EmptyNavMesh)?;
    compact::erode_walkable_area(&mut chf, config.radius_cells());
    compact::build_distance_field(&mut chf);
    region::build_regions(&mut chf, 1, 4);

    let contours = contour::build_contours(&chf, config.edge_max_err(), config);
    if contours.is_empty() {
        return Err(NavError::EmptyNavMesh);
    }

    let poly_mesh = mesher::build_poly_mesh(&contours).ok_or(NavError::EmptyNavMesh)?;
    let detail = detail::build_detail_mesh(&poly_mesh, &chf, config);

    let mesh = navmesh::NavMesh::from_poly_mesh(poly_mesh, detail, &chf);
    if !mesh.polygons().iter().any(|p| p.is_walkable()) {
        return Err(NavError::EmptyNavMesh);
    }
    debug!(
        polygons = mesh.polygons().len(),
        vertices = mesh.vertices().len(),
        "navmesh build complete"
    );
    Ok(mesh)
}

#[cfg(test)]
pub(crate) mod test_geometry {
    //! Shared soup builders for the crate's tests.

    /// A flat square floor made of two triangles, `size`×`size`, at `y`.
    pub fn floor(size: f32, y: f32) -> (Vec<f32>, Vec<u32>) {
        let h = size / 2.0;
        let positions = vec![
            -h, y, -h, //
            -h, y, h, //
            h, y, h, //
            h, y, -h,
        ];
        let indices = vec![0, 1, 2, 0, 2, 3];
        (positions, indices)
    }

    /// A gridded floor (more triangles, same plane) to give the voxelizer and
    /// regions something non-trivial.
    pub fn gridded_floor(size: f32, y: f32, cells: u32) -> (Vec<f32>, Vec<u32>) {
        let mut positions = Vec::new();
        let mut indices = Vec::new();
        let step = size / cells as f32;
        let h = size / 2.0;
        for zi in 0..=cells {
            for xi in 0..=cells {
                positions.extend_from_slice(&[-h + xi as f32 * step, y, -h + zi as f32 * step]);
            }
        }
        let stride = cells + 1;
        for zi in 0..cells {
            for xi in 0..cells {
                let a = zi * stride + xi;
                let b = a + 1;
                let c = a + stride;
                let d = c + 1;
                indices.extend_from_slice(&[a, c, d, a, d, b]);
            }
        }
        (positions, indices)
    }

    /// Append an axis-aligned box (12 triangles) to a soup.
    pub fn append_box(
        positions: &mut Vec<f32>,
        indices: &mut Vec<u32>,
        center: glam::Vec3,
        half: glam::Vec3,
    ) {
        let base = (positions.len() / 3) as u32;
        for corner in [
            glam::Vec3::new(-1.0, -1.0, -1.0),
            glam::Vec3::new(1.0, -1.0, -1.0),
            glam::Vec3::new(1.0, -1.0, 1.0),
            glam::Vec3::new(-1.0, -1.0, 1.0),
            glam::Vec3::new(-1.0, 1.0, -1.0),
            glam::Vec3::new(1.0, 1.0, -1.0),
            glam::Vec3::new(1.0, 1.0, 1.0),
            glam::Vec3::new(-1.0, 1.0, 1.0),
        ] {
            let p = center + corner * half;
            positions.extend_from_slice(&[p.x, p.y, p.z]);
        }
        const FACES: [[u32; 6]; 6] = [
            [4, 7, 6, 4, 6, 5],
            [0, 1, 2, 0, 2, 3],
            [3, 2, 6, 3, 6, 7],
            [0, 4, 5, 0, 5, 1],
            [1, 5, 6, 1, 6, 2],
            [0, 3, 7, 0, 7, 4],
        ];
        for face in FACES {
            indices.extend(face.iter().map(|i| base + i));
        }
    }
}
