//! Local collision prediction and priority-based resolution.
//!
//! Agents on a collision course resolve asymmetrically: the lower entity id
//! yields with a perpendicular detour waypoint, the higher id keeps its path
//! and slows down. Non-critical neighbours only contribute separation
//! steering. The asymmetry is what prevents mirror-image deadlocks.

use glam::Vec3;
use skarn_geom::flatten;
use skarn_physics::EntityId;

/// Prediction horizon for closest-approach tests, seconds.
pub(crate) const COLLISION_LOOKAHEAD: f32 = 1.5;
/// Detour waypoint offset from the threatening agent, meters.
pub(crate) const DETOUR_OFFSET: f32 = 3.0;
/// Speed factor applied to the non-yielding agent while a threat persists.
pub(crate) const THREAT_SPEED_FACTOR: f32 = 0.75;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Approach {
    /// Time of closest approach within the lookahead, seconds.
    pub time: f32,
    /// Predicted XZ separation at that time.
    pub miss_distance: f32,
}

/// Closest approach of two agents over the lookahead, from current positions
/// and velocities projected on the XZ plane.
pub(crate) fn predict_closest_approach(
    position_a: Vec3,
    velocity_a: Vec3,
    position_b: Vec3,
    velocity_b: Vec3,
) -> Approach {
    let rel_pos = flatten(position_b - position_a);
    let rel_vel = flatten(velocity_b - velocity_a);

    let speed_sq = rel_vel.length_squared();
    let time = if speed_sq < 1e-6 {
        0.0
    } else {
        (-rel_pos.dot(rel_vel) / speed_sq).clamp(0.0, COLLISION_LOOKAHEAD)
    };

    Approach {
        time,
        miss_distance: (rel_pos + rel_vel * time).length(),
    }
}

/// A collision is critical when the predicted miss distance is below the sum
/// of radii within the lookahead.
pub(crate) fn is_critical(approach: &Approach, radius_a: f32, radius_b: f32) -> bool {
    approach.miss_distance < radius_a + radius_b
}

/// Detour point for the yielding agent: offset perpendicular (XZ right-hand)
/// from the other agent's position, relative to the yielder's travel
/// direction. Y is left for the caller to clamp to the navmesh.
pub(crate) fn detour_point(travel_direction: Vec3, other_position: Vec3) -> Vec3 {
    let dir = flatten(travel_direction).normalize_or_zero();
    let right = Vec3::new(dir.z, 0.0, -dir.x);
    other_position + right * DETOUR_OFFSET
}

/// Separation steering away from non-critical neighbours inside the
/// separation radius. Falls off linearly with distance.
pub(crate) fn separation_velocity(
    position: Vec3,
    neighbours: &[(EntityId, Vec3)],
    separation_radius: f32,
    strength: f32,
) -> Vec3 {
    let mut steering = Vec3::ZERO;
    for (_, other) in neighbours {
        let away = flatten(position - *other);
        let distance = away.length();
        if distance < 1e-4 || distance >= separation_radius {
            continue;
        }
        let falloff = 1.0 - distance / separation_radius;
        steering += away / distance * falloff * strength;
    }
    steering
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn head_on_approach_is_critical() {
        // Two agents 10m apart closing at 6 m/s: closest approach at ~1.5s
        // horizon edge, miss distance shrinking to 1m by then.
        let a = predict_closest_approach(
            Vec3::new(-5.0, 1.4, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            Vec3::new(5.0, 1.4, 0.0),
            Vec3::new(-3.0, 0.0, 0.0),
        );
        assert_relative_eq!(a.time, COLLISION_LOOKAHEAD);
        assert_relative_eq!(a.miss_distance, 1.0, epsilon = 1e-4);
        assert!(is_critical(&a, 0.5, 0.5));
    }

    #[test]
    fn parallel_agents_are_not_critical() {
        let a = predict_closest_approach(
            Vec3::new(0.0, 1.4, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            Vec3::new(0.0, 1.4, 3.0),
            Vec3::new(3.0, 0.0, 0.0),
        );
        assert_relative_eq!(a.miss_distance, 3.0, epsilon = 1e-4);
        assert!(!is_critical(&a, 0.5, 0.5));
    }

    #[test]
    fn diverging_agents_use_time_zero() {
        let a = predict_closest_approach(
            Vec3::new(0.0, 1.4, 0.0),
            Vec3::new(-3.0, 0.0, 0.0),
            Vec3::new(4.0, 1.4, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
        );
        assert_relative_eq!(a.time, 0.0);
        assert_relative_eq!(a.miss_distance, 4.0, epsilon = 1e-4);
    }

    #[test]
    fn detour_is_perpendicular_to_travel() {
        let other = Vec3::new(5.0, 1.4, 0.0);
        let detour = detour_point(Vec3::new(1.0, 0.0, 0.0), other);
        // Right-hand of +x travel offsets along -z.
        assert_relative_eq!(detour.x, 5.0);
        assert_relative_eq!(detour.z, -DETOUR_OFFSET);
    }

    #[test]
    fn separation_pushes_away_and_falls_off() {
        let neighbours = vec![(2u32, Vec3::new(1.0, 1.4, 0.0))];
        let v = separation_velocity(Vec3::new(0.0, 1.4, 0.0), &neighbours, 2.0, 2.0);
        assert!(v.x < 0.0, "steering away from +x neighbour: {v}");
        assert_relative_eq!(v.z, 0.0);
        // Half the radius -> half the strength.
        assert_relative_eq!(v.x, -1.0, epsilon = 1e-4);

        // Outside the radius: no contribution.
        let far = vec![(2u32, Vec3::new(5.0, 1.4, 0.0))];
        assert_eq!(
            separation_velocity(Vec3::new(0.0, 1.4, 0.0), &far, 2.0, 2.0),
            Vec3::ZERO
        );
    }
}
