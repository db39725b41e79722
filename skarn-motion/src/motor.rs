//! Motor character controller.
//!
//! Horizontal motion is a proportional blend of the current velocity toward
//! the commanded direction; vertical motion is a proportional height
//! controller against the navmesh surface, damped inside the tolerance band
//! so grounded agents neither bounce nor drift.

use glam::Vec3;
use skarn_geom::flatten;

use crate::config::MotorCharacterConfig;

/// Tolerance band while tracking a slope; tighter than the flat-ground band
/// so ramps do not modulate horizontal speed.
pub(crate) const SLOPE_HEIGHT_TOLERANCE: f32 = 0.15;

pub(crate) struct MotorFrame {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Current waypoint the agent steers toward; `None` when idle.
    pub target: Option<Vec3>,
    pub effective_speed: f32,
    /// Separation steering, already scaled; zero on critical-avoidance ticks.
    pub separation: Vec3,
    /// Navmesh surface height at the agent's XZ, when available.
    pub surface_y: Option<f32>,
    pub on_slope: bool,
}

/// Desired velocity for this step. The caller writes it to the body; gravity
/// and contacts shape it afterwards.
pub(crate) fn drive(
    frame: &MotorFrame,
    config: &MotorCharacterConfig,
    agent_half_height: f32,
) -> Vec3 {
    let current_xz = flatten(frame.velocity);

    let desired_xz = match frame.target {
        Some(target) => {
            let to_target = flatten(target - frame.position);
            let dir = to_target.normalize_or_zero();
            dir * frame.effective_speed + frame.separation
        }
        None => Vec3::ZERO,
    };

    let new_xz = current_xz.lerp(desired_xz, config.motor_strength);

    let vy = vertical_velocity(frame, config, agent_half_height);

    Vec3::new(new_xz.x, vy, new_xz.z)
}

fn vertical_velocity(frame: &MotorFrame, config: &MotorCharacterConfig, half_height: f32) -> f32 {
    let Some(surface_y) = frame.surface_y else {
        // Off-mesh: leave vertical motion to physics.
        return frame.velocity.y;
    };

    let target_y = surface_y + half_height;
    let y_error = target_y - frame.position.y;
    let tolerance = if frame.on_slope {
        SLOPE_HEIGHT_TOLERANCE
    } else {
        config.height_error_tolerance
    };

    if y_error.abs() < tolerance {
        let damping = if frame.target.is_some() {
            config.vertical_damping
        } else {
            config.idle_vertical_damping
        };
        frame.velocity.y * damping
    } else {
        (y_error * config.height_correction_strength)
            .clamp(-config.max_vertical_correction, config.max_vertical_correction)
    }
}

/// Yaw-only facing from intended planar motion, or `None` when the delta is
/// negligible.
pub(crate) fn facing_from_motion(delta_xz: Vec3) -> Option<glam::Quat> {
    if delta_xz.x * delta_xz.x + delta_xz.z * delta_xz.z <= 1e-8 {
        return None;
    }
    let yaw = (-delta_xz.x).atan2(-delta_xz.z);
    Some(glam::Quat::from_rotation_y(yaw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame(position: Vec3, velocity: Vec3, target: Option<Vec3>) -> MotorFrame {
        MotorFrame {
            position,
            velocity,
            target,
            effective_speed: 3.0,
            separation: Vec3::ZERO,
            surface_y: Some(0.0),
            on_slope: false,
        }
    }

    #[test]
    fn horizontal_velocity_blends_toward_target() {
        let config = MotorCharacterConfig::default();
        let f = frame(
            Vec3::new(0.0, 1.4, 0.0),
            Vec3::ZERO,
            Some(Vec3::new(10.0, 1.4, 0.0)),
        );
        let v = drive(&f, &config, 1.4);
        // One blend step at strength 0.15 toward 3 m/s.
        assert_relative_eq!(v.x, 3.0 * 0.15, epsilon = 1e-5);
        assert_relative_eq!(v.z, 0.0);
    }

    #[test]
    fn repeated_blending_converges_to_speed() {
        let config = MotorCharacterConfig::default();
        let mut velocity = Vec3::ZERO;
        for _ in 0..100 {
            let f = frame(
                Vec3::new(0.0, 1.4, 0.0),
                velocity,
                Some(Vec3::new(100.0, 1.4, 0.0)),
            );
            velocity = drive(&f, &config, 1.4);
        }
        assert!((velocity.x - 3.0).abs() < 0.01, "converged to {}", velocity.x);
    }

    #[test]
    fn height_error_produces_clamped_correction() {
        let config = MotorCharacterConfig::default();
        // Agent 1m below target height: correction saturates at the cap.
        let f = frame(Vec3::new(0.0, 0.4, 0.0), Vec3::ZERO, None);
        let v = drive(&f, &config, 1.4);
        assert_relative_eq!(v.y, config.max_vertical_correction);

        // Slightly above: small negative correction.
        let f = frame(Vec3::new(0.0, 1.7, 0.0), Vec3::ZERO, None);
        let v = drive(&f, &config, 1.4);
        assert!(v.y < 0.0 && v.y > -config.max_vertical_correction);
    }

    #[test]
    fn inside_tolerance_band_damps() {
        let config = MotorCharacterConfig::default();
        let f = frame(
            Vec3::new(0.0, 1.5, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Some(Vec3::new(5.0, 1.4, 0.0)),
        );
        let v = drive(&f, &config, 1.4);
        assert_relative_eq!(v.y, 1.0 * config.vertical_damping);

        // Idle agents damp harder.
        let f = frame(Vec3::new(0.0, 1.5, 0.0), Vec3::new(0.0, 1.0, 0.0), None);
        let v = drive(&f, &config, 1.4);
        assert_relative_eq!(v.y, 1.0 * config.idle_vertical_damping);
    }

    #[test]
    fn slope_band_is_tighter() {
        let config = MotorCharacterConfig::default();
        let mut f = frame(Vec3::new(0.0, 1.6, 0.0), Vec3::ZERO, Some(Vec3::X));
        // 0.2m error: inside flat tolerance (0.25), outside slope band (0.15).
        f.on_slope = false;
        assert_relative_eq!(drive(&f, &config, 1.4).y, 0.0);
        f.on_slope = true;
        assert!(drive(&f, &config, 1.4).y < 0.0);
    }

    #[test]
    fn off_mesh_leaves_vertical_to_physics() {
        let config = MotorCharacterConfig::default();
        let mut f = frame(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, -3.0, 0.0), None);
        f.surface_y = None;
        assert_relative_eq!(drive(&f, &config, 1.4).y, -3.0);
    }

    #[test]
    fn facing_matches_travel_direction() {
        let q = facing_from_motion(Vec3::new(0.0, 0.0, -1.0)).unwrap();
        // Forward (-z) travel keeps identity-ish yaw under the server's
        // facing convention.
        let forward = q * Vec3::new(0.0, 0.0, -1.0);
        assert!((forward.z + 1.0).abs() < 1e-4, "forward {forward}");
        assert!(facing_from_motion(Vec3::ZERO).is_none());
    }
}
