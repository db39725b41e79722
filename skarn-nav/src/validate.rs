//! Post-hoc path validation against agent limits, and linear auto-fix.
//!
//! The planner's corridor already lies on the navmesh, so repairs never
//! re-query polygons: an over-steep vertical step is split into equal linear
//! sub-steps and the result re-validated. The bridge-artefact helpers flag
//! polylines that cross space no agent could actually traverse (voxel bridges
//! over voids), which callers treat as unreachable.

use glam::Vec3;
use skarn_geom::horizontal_distance;
use tracing::warn;

use crate::{AgentConfig, NavError};

/// Horizontal distances below this are treated as pure-vertical segments and
/// skip the slope check.
const SLOPE_CHECK_MIN_HORIZONTAL: f32 = 0.01;

/// A segment that fails validation.
#[derive(Clone, Debug)]
pub struct SegmentViolation {
    pub segment_index: usize,
    pub reason: String,
}

impl From<SegmentViolation> for NavError {
    fn from(v: SegmentViolation) -> Self {
        NavError::PathInvalid {
            reason: v.reason,
            segment_index: v.segment_index,
        }
    }
}

/// Check every consecutive waypoint pair against the agent's climb and slope
/// limits.
pub fn validate_path(waypoints: &[Vec3], config: &AgentConfig) -> Result<(), SegmentViolation> {
    for (i, pair) in waypoints.windows(2).enumerate() {
        let dy = (pair[1].y - pair[0].y).abs();
        let horizontal = horizontal_distance(pair[0], pair[1]);

        if dy > config.max_climb {
            return Err(SegmentViolation {
                segment_index: i,
                reason: format!(
                    "vertical step {:.2}m exceeds max climb {:.2}m",
                    dy, config.max_climb
                ),
            });
        }
        if horizontal > SLOPE_CHECK_MIN_HORIZONTAL {
            let slope_deg = dy.atan2(horizontal).to_degrees();
            if slope_deg > config.max_slope_deg {
                return Err(SegmentViolation {
                    segment_index: i,
                    reason: format!(
                        "slope {:.1}° exceeds max slope {:.1}°",
                        slope_deg, config.max_slope_deg
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Split every climb-violating segment into `ceil(|Δy|/max_climb)` equal
/// linear sub-steps and re-validate. Returns `None` when the repaired path
/// still fails (the terrain itself is too steep). Idempotent on valid paths.
pub fn try_fix_path(waypoints: &[Vec3], config: &AgentConfig) -> Option<Vec<Vec3>> {
    if validate_path(waypoints, config).is_ok() {
        return Some(waypoints.to_vec());
    }

    let mut fixed = Vec::with_capacity(waypoints.len());
    for (i, pair) in waypoints.windows(2).enumerate() {
        if i == 0 {
            fixed.push(pair[0]);
        }
        let dy = (pair[1].y - pair[0].y).abs();
        if dy > config.max_climb && config.max_climb > 0.0 {
            let steps = (dy / config.max_climb).ceil() as usize;
            for s in 1..steps {
                let t = s as f32 / steps as f32;
                fixed.push(pair[0].lerp(pair[1], t));
            }
        }
        fixed.push(pair[1]);
    }

    match validate_path(&fixed, config) {
        Ok(()) => Some(fixed),
        Err(violation) => {
            warn!(
                segment = violation.segment_index,
                reason = %violation.reason,
                "path auto-fix rejected"
            );
            None
        }
    }
}

/// Heuristics for navmesh-bridge artefacts: segments the polygon mesh claims
/// are connected but no agent could walk.
pub fn likely_bridge_artefact(a: Vec3, b: Vec3) -> Option<&'static str> {
    let dy = (b.y - a.y).abs();
    let horizontal = horizontal_distance(a, b);

    if dy > 2.0 && horizontal < 1.0 {
        return Some("cliff: large vertical step over almost no horizontal distance");
    }
    if dy > 3.0 && horizontal > 0.0 && dy / horizontal > 0.5 {
        return Some("gap: steep span across a void");
    }
    if horizontal > 25.0 {
        return Some("bridge: implausibly long polygon crossing");
    }
    None
}

/// First bridge-artefact segment of a polyline, if any.
pub fn find_bridge_artefact(waypoints: &[Vec3]) -> Option<(usize, &'static str)> {
    waypoints
        .windows(2)
        .enumerate()
        .find_map(|(i, pair)| likely_bridge_artefact(pair[0], pair[1]).map(|reason| (i, reason)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::default()
    }

    #[test]
    fn flat_path_is_valid() {
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(3.0, 0.1, 0.0),
            Vec3::new(6.0, 0.0, 0.0),
        ];
        assert!(validate_path(&path, &config()).is_ok());
    }

    #[test]
    fn climb_violation_reports_segment() {
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 2.0, 0.0),
        ];
        let violation = validate_path(&path, &config()).unwrap_err();
        assert_eq!(violation.segment_index, 1);
        assert!(violation.reason.contains("max climb"));
    }

    #[test]
    fn pure_vertical_segment_skips_slope_check() {
        // 1cm horizontal, small vertical: climb check alone decides.
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.005, 0.3, 0.0),
        ];
        assert!(validate_path(&path, &config()).is_ok());

        let too_high = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.005, 0.5, 0.0),
        ];
        assert!(validate_path(&too_high, &config()).is_err());
    }

    #[test]
    fn slope_violation_detected() {
        // 60° slope, each step within climb.
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.2, 0.35, 0.0),
        ];
        let violation = validate_path(&path, &config()).unwrap_err();
        assert!(violation.reason.contains("slope"));
    }

    #[test]
    fn fix_is_identity_on_valid_paths() {
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(5.0, 0.2, 0.0),
        ];
        let fixed = try_fix_path(&path, &config()).unwrap();
        assert_eq!(fixed, path);
        // And idempotent on its own output.
        assert_eq!(try_fix_path(&fixed, &config()).unwrap(), fixed);
    }

    #[test]
    fn fix_subdivides_tall_ramp_segments() {
        // 10m rise over 14m horizontal: 35.5° slope (fine), but one segment.
        let path = vec![
            Vec3::new(0.0, -2.0, 0.0),
            Vec3::new(14.0, 8.0, 0.0),
        ];
        assert!(validate_path(&path, &config()).is_err());

        let fixed = try_fix_path(&path, &config()).unwrap();
        assert!(validate_path(&fixed, &config()).is_ok());
        // ceil(10 / 0.4) = 25 sub-steps -> 26 waypoints.
        assert_eq!(fixed.len(), 26);
        assert_eq!(fixed[0], path[0]);
        assert_eq!(*fixed.last().unwrap(), path[1]);
    }

    #[test]
    fn fix_rejects_true_cliffs() {
        // 3m rise over 1m: every sub-step keeps the 71.6° slope, so the
        // repaired path still fails and the fix must be rejected.
        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 3.0, 0.0),
        ];
        assert!(try_fix_path(&path, &config()).is_none());
    }

    #[test]
    fn bridge_artefacts_flagged() {
        assert!(likely_bridge_artefact(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.5, 2.5, 0.0)
        )
        .is_some());
        assert!(likely_bridge_artefact(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(6.0, 3.5, 0.0)
        )
        .is_some());
        assert!(likely_bridge_artefact(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(30.0, 0.0, 0.0)
        )
        .is_some());
        assert!(likely_bridge_artefact(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(5.0, 0.2, 0.0)
        )
        .is_none());

        let path = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.2, 2.8, 0.0),
        ];
        assert_eq!(find_bridge_artefact(&path).map(|(i, _)| i), Some(1));
    }
}
