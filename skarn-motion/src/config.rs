//! Movement-layer configuration.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathfindingConfig {
    /// Seconds of simulated time between path revalidations.
    pub path_validation_interval: f32,
    pub enable_local_avoidance: bool,
    pub local_avoidance_radius: f32,
    pub max_avoidance_neighbors: usize,
    pub avoidance_strength: f32,
    pub separation_radius: f32,
    /// Try steering around temporary blockages before replanning.
    pub try_local_avoidance_first: bool,
    pub enable_automatic_replanning: bool,
    pub replan_cooldown: f32,
    pub waypoint_reached_threshold: f32,
    pub destination_reached_threshold: f32,
    pub pathfinding_search_extents_horizontal: f32,
    pub pathfinding_search_extents_vertical: f32,
}

impl Default for PathfindingConfig {
    fn default() -> Self {
        Self {
            path_validation_interval: 0.5,
            enable_local_avoidance: true,
            local_avoidance_radius: 5.0,
            max_avoidance_neighbors: 5,
            avoidance_strength: 2.0,
            separation_radius: 2.0,
            try_local_avoidance_first: true,
            enable_automatic_replanning: true,
            replan_cooldown: 1.0,
            waypoint_reached_threshold: 0.5,
            destination_reached_threshold: 0.3,
            pathfinding_search_extents_horizontal: 5.0,
            pathfinding_search_extents_vertical: 10.0,
        }
    }
}

impl PathfindingConfig {
    pub fn search_extents(&self) -> glam::Vec3 {
        glam::Vec3::new(
            self.pathfinding_search_extents_horizontal,
            self.pathfinding_search_extents_vertical,
            self.pathfinding_search_extents_horizontal,
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MotorCharacterConfig {
    /// Per-step proportional gain blending commanded horizontal velocity
    /// toward the target.
    pub motor_strength: f32,
    pub height_correction_strength: f32,
    /// Cap on the vertical correction velocity, m/s.
    pub max_vertical_correction: f32,
    pub height_error_tolerance: f32,
    pub vertical_damping: f32,
    pub idle_vertical_damping: f32,
}

impl Default for MotorCharacterConfig {
    fn default() -> Self {
        Self {
            motor_strength: 0.15,
            height_correction_strength: 6.5,
            max_vertical_correction: 3.5,
            height_error_tolerance: 0.25,
            vertical_damping: 0.75,
            idle_vertical_damping: 0.4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuning() {
        let p = PathfindingConfig::default();
        assert_eq!(p.path_validation_interval, 0.5);
        assert_eq!(p.replan_cooldown, 1.0);
        assert_eq!(p.waypoint_reached_threshold, 0.5);
        assert_eq!(p.destination_reached_threshold, 0.3);
        assert_eq!(p.search_extents(), glam::Vec3::new(5.0, 10.0, 5.0));

        let m = MotorCharacterConfig::default();
        assert_eq!(m.motor_strength, 0.15);
        assert_eq!(m.height_correction_strength, 6.5);
    }

    #[test]
    fn configs_roundtrip_through_serde() {
        let p = PathfindingConfig::default();
        let json = serde_json::to_string(&p).unwrap();
        let back: PathfindingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.local_avoidance_radius, p.local_avoidance_radius);
    }
}
