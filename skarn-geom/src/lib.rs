//! Geometry primitives shared by the navmesh builder and the motion layer.
//!
//! Vectors and quaternions come from [`glam`]; this crate adds the few shapes
//! and planar helpers the rest of the workspace keeps reaching for. Units are
//! meters, angles are radians unless a name says otherwise.

use glam::Vec3;

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Self::EMPTY;
        for p in points {
            aabb.insert(p);
        }
        aabb
    }

    pub fn insert(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow by `below` on -Y and `above` on +Y.
    pub fn expand_vertical(self, below: f32, above: f32) -> Self {
        Self {
            min: self.min - Vec3::new(0.0, below, 0.0),
            max: self.max + Vec3::new(0.0, above, 0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Overlap test on the XZ plane only.
    pub fn overlaps_xz(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// A triangle in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triangle {
    pub a: Vec3,
    pub b: Vec3,
    pub c: Vec3,
}

impl Triangle {
    pub fn new(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self { a, b, c }
    }

    pub fn normal(&self) -> Vec3 {
        (self.b - self.a).cross(self.c - self.a).normalize_or_zero()
    }

    pub fn centroid(&self) -> Vec3 {
        (self.a + self.b + self.c) / 3.0
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_points([self.a, self.b, self.c])
    }

    /// Collinear or zero-area triangles contribute nothing to rasterization.
    pub fn is_degenerate(&self) -> bool {
        (self.b - self.a).cross(self.c - self.a).length_squared() < 1e-10
    }

    /// Point-in-triangle test projected onto the XZ plane.
    pub fn contains_xz(&self, p: Vec3) -> bool {
        let sign = |a: Vec3, b: Vec3, c: Vec3| (b.x - a.x) * (c.z - a.z) - (b.z - a.z) * (c.x - a.x);

        let d1 = sign(self.a, self.b, p);
        let d2 = sign(self.b, self.c, p);
        let d3 = sign(self.c, self.a, p);

        let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
        let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
        !(has_neg && has_pos)
    }

    /// Interpolated Y on the triangle plane at the given XZ, or `None` when the
    /// point projects outside the triangle or the plane is vertical.
    pub fn height_at_xz(&self, p: Vec3) -> Option<f32> {
        if !self.contains_xz(p) {
            return None;
        }
        let n = (self.b - self.a).cross(self.c - self.a);
        if n.y.abs() < 1e-6 {
            return None;
        }
        // Plane equation: n · (x - a) = 0, solved for y.
        let d = n.dot(self.a);
        Some((d - n.x * p.x - n.z * p.z) / n.y)
    }
}

/// Distance between two points projected onto the XZ plane.
#[inline]
pub fn horizontal_distance(a: Vec3, b: Vec3) -> f32 {
    horizontal_distance_sq(a, b).sqrt()
}

#[inline]
pub fn horizontal_distance_sq(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// The XZ components of `v` with Y zeroed.
#[inline]
pub fn flatten(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Squared distance from `point` to the segment `a`-`b` on the XZ plane.
pub fn point_segment_distance_sq_xz(point: Vec3, a: Vec3, b: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let apx = point.x - a.x;
    let apz = point.z - a.z;
    let d = abx * abx + abz * abz;
    let mut t = abx * apx + abz * apz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = a.x + t * abx - point.x;
    let dz = a.z + t * abz - point.z;
    dx * dx + dz * dz
}
