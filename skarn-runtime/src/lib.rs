//! Top-level facade wiring the physics world, the navmesh planner, and the
//! motion orchestrator into one deterministic, single-threaded runtime.
//!
//! Frame order is fixed: `tick()` runs the orchestrator update (which reads
//! poses and writes commanded velocities), then advances the physics world by
//! exactly one fixed timestep. Movement events fire during the update,
//! collision events during the step. A host may run any number of independent
//! runtimes; there is no shared state.

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use skarn_motion::{
    AgentConfig, CharacterState, MotionError, MotionOrchestrator, MotorCharacterConfig,
    MovementEvent, MovementRequest, MovementState, PathfindingConfig,
};
pub use skarn_nav::{
    build_navmesh, filter_occluded_triangles, find_bridge_artefact, try_fix_path, validate_path,
    NavError, NavMesh, NavMeshQuery, Path, SegmentViolation, TriangleInput,
};
pub use skarn_physics::{
    BodyHandle, CollisionEvent, EntityId, EntityType, EntityTypes, Mobility, PhysicsConfig,
    PhysicsError, PhysicsWorld, RigidPose, ShapeDesc,
};

/// Aggregate configuration; every section carries production-tuned defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub physics: PhysicsConfig,
    pub pathfinding: PathfindingConfig,
    pub motor: MotorCharacterConfig,
}

impl RuntimeConfig {
    /// Load from a JSON document; missing sections keep their defaults.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

pub struct SpatialRuntime {
    world: PhysicsWorld,
    query: Option<NavMeshQuery>,
    orchestrator: MotionOrchestrator,
    timestep: f32,
}

impl SpatialRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let timestep = config.physics.timestep;
        Self {
            world: PhysicsWorld::new(config.physics),
            query: None,
            orchestrator: MotionOrchestrator::new(
                config.agent,
                config.pathfinding,
                config.motor,
            ),
            timestep,
        }
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut PhysicsWorld {
        &mut self.world
    }

    pub fn orchestrator(&self) -> &MotionOrchestrator {
        &self.orchestrator
    }

    pub fn timestep(&self) -> f32 {
        self.timestep
    }

    pub fn navmesh(&self) -> Option<&NavMesh> {
        self.query.as_ref().map(|q| q.mesh())
    }

    /// Build the navmesh from an explicit triangle soup.
    pub fn build_navmesh(&mut self, input: &TriangleInput) -> Result<(), NavError> {
        let agent = *self.orchestrator.agent_config();
        let mesh = build_navmesh(input, &agent)?;
        info!(polygons = mesh.polygons().len(), "navmesh ready");
        self.query = Some(NavMeshQuery::new(Arc::new(mesh)));
        Ok(())
    }

    /// Build the navmesh from the static bodies currently registered in the
    /// physics world.
    pub fn build_navmesh_from_statics(&mut self) -> Result<(), NavError> {
        let (positions, indices) = self.world.static_geometry();
        let input = TriangleInput {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        self.build_navmesh(&input)
    }

    fn query(&self) -> Result<&NavMeshQuery, NavError> {
        // Without a built mesh every search uniformly fails.
        self.query.as_ref().ok_or(NavError::NoPath)
    }

    /// One frame: orchestrator update, then exactly one physics step.
    pub fn tick(&mut self) -> Result<(), PhysicsError> {
        if let Some(query) = self.query.as_ref() {
            self.orchestrator.update(&mut self.world, query, self.timestep);
        }
        self.world.step(self.timestep)
    }

    pub fn set_movement_listener(&mut self, listener: impl FnMut(&MovementEvent) + 'static) {
        self.orchestrator.set_event_listener(listener);
    }

    pub fn set_collision_listener(&mut self, listener: impl FnMut(&CollisionEvent) + 'static) {
        self.world.set_collision_listener(listener);
    }

    pub fn find_path(&self, start: Vec3, goal: Vec3) -> Result<Path, NavError> {
        let query = self.query()?;
        query.find_path(start, goal, NavMeshQuery::default_extents())
    }

    pub fn request_movement(&mut self, request: MovementRequest) -> Result<(), MotionError> {
        let query = self
            .query
            .as_ref()
            .ok_or(MotionError::Nav(NavError::NoPath))?
            .clone();
        self.orchestrator
            .request_movement(&mut self.world, &query, request)
    }

    pub fn stop_movement(&mut self, id: EntityId) {
        self.orchestrator.stop_movement(&mut self.world, id);
    }

    pub fn jump(&mut self, id: EntityId, force: f32) -> Result<(), MotionError> {
        self.orchestrator.jump(&mut self.world, id, force)
    }

    pub fn knockback(
        &mut self,
        id: EntityId,
        direction: Vec3,
        force: f32,
    ) -> Result<(), MotionError> {
        self.orchestrator
            .knockback(&mut self.world, id, direction, force)
    }

    pub fn push(
        &mut self,
        id: EntityId,
        direction: Vec3,
        force: f32,
        make_pushable: bool,
        duration: Option<f32>,
    ) -> Result<(), MotionError> {
        self.orchestrator
            .push(&mut self.world, id, direction, force, make_pushable, duration)
    }

    pub fn get_character_state(&self, id: EntityId) -> Option<CharacterState> {
        self.orchestrator.get_character_state(id)
    }

    pub fn get_waypoints(&self, id: EntityId) -> Option<&[Vec3]> {
        self.orchestrator.get_waypoints(id)
    }

    pub fn get_current_waypoint_index(&self, id: EntityId) -> Option<usize> {
        self.orchestrator.get_current_waypoint_index(id)
    }

    pub fn movement_state(&self, id: EntityId) -> Option<&MovementState> {
        self.orchestrator.movement_state(id)
    }
}
