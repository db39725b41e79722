//! Movement orchestration: per-agent state machines, the motor character
//! controller, local avoidance, and path revalidation/replanning.
//!
//! The orchestrator owns all [`MovementState`]s and drives commanded
//! velocities into the physics world each update; the world steps afterwards.
//! Components are injected per call (`world`, `query`) so there are no
//! back-pointers between the physics, planning, and movement layers.

use glam::Vec3;
use rustc_hash::FxHashMap;
use skarn_geom::{flatten, horizontal_distance};
use skarn_nav::{find_bridge_artefact, try_fix_path, validate_path, NavMeshQuery};
use skarn_physics::{EntityId, EntityTypes, PhysicsWorld, RigidPose};
use tracing::{debug, warn};

mod avoidance;
pub mod config;
mod motor;

pub use config::{MotorCharacterConfig, PathfindingConfig};
pub use skarn_nav::AgentConfig;

/// Ground-relationship of a character, orthogonal to its physics mobility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharacterState {
    Grounded,
    Airborne,
    Recovering,
}

/// Seconds the vertical velocity must stay below [`SETTLE_SPEED`] before a
/// recovering character is trusted as grounded again.
const STABILITY_WINDOW: f32 = 0.2;
const SETTLE_SPEED: f32 = 0.1;
/// A recovering character with sustained contact is re-grounded after this
/// long even if it never goes vertically still (sliding on a slope keeps a
/// standing vertical-velocity component).
const RECOVERY_TIMEOUT: f32 = 0.6;
/// Suppresses the Airborne->Recovering transition right after a jump or
/// knockback, while the body is still in contact on its way up.
const AIRBORNE_GRACE: f32 = 0.15;
/// Below-target threshold before recovery impulses are applied.
const RECOVERY_DEADBAND: f32 = 0.1;
const RECOVERY_GAIN: f32 = 2.0;
/// Waypoints closer than this on XZ are considered identical and skipped.
const WAYPOINT_SKIP_DISTANCE: f32 = 0.1;
/// Vertical delta to the next waypoint that marks the segment as a slope.
const SLOPE_DELTA_Y: f32 = 0.5;
const SLOPE_GROUNDING_PERIOD: u32 = 5;
const EDGE_CHECK_PERIOD: u32 = 10;
/// Consecutive failed validations before local avoidance is declared
/// insufficient and a replan is forced.
const MAX_BLOCKED_VALIDATIONS: u32 = 2;
/// Extents for per-step surface grounding queries.
const GROUNDING_EXTENTS: Vec3 = Vec3::new(1.0, 2.0, 1.0);

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),
    #[error("entity {0} is not a dynamic agent")]
    NotAnAgent(EntityId),
    #[error("agent {0} is not grounded")]
    NotGrounded(EntityId),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("target unreachable: {0}")]
    Unreachable(&'static str),
    #[error(transparent)]
    Physics(#[from] skarn_physics::PhysicsError),
    #[error(transparent)]
    Nav(#[from] skarn_nav::NavError),
}

/// Events delivered synchronously on the calling thread during `update`.
#[derive(Clone, Debug, PartialEq)]
pub enum MovementEvent {
    MovementStarted {
        id: EntityId,
        start: Vec3,
        goal: Vec3,
    },
    /// `fraction` = waypoint index / waypoint count, in `[0, 1]`.
    MovementProgress { id: EntityId, fraction: f32 },
    PathBlocked { id: EntityId },
    PathReplanned { id: EntityId },
    /// Fired exactly once per `request_movement`.
    DestinationReached { id: EntityId, final_position: Vec3 },
}

#[derive(Clone, Debug)]
pub struct MovementRequest {
    pub entity_id: EntityId,
    pub target_position: Vec3,
    pub max_speed: f32,
}

/// Per-agent movement bookkeeping. Lingers in `is_completed` after arrival so
/// height correction stays alive until `stop_movement` or body removal.
#[derive(Clone, Debug)]
pub struct MovementState {
    pub entity_id: EntityId,
    pub target_position: Vec3,
    pub max_speed: f32,
    pub agent_height: f32,
    pub agent_radius: f32,
    pub waypoints: Vec<Vec3>,
    pub current_waypoint_index: usize,
    pub last_validation_time: f32,
    pub last_replan_time: f32,
    pub start_time: f32,
    pub total_distance: f32,
    pub is_completed: bool,
    pub is_avoiding_collision: bool,
    pub has_detour_waypoint: bool,
    pub edge_check_counter: u32,
    pub slope_grounding_counter: u32,
    blocked_validations: u32,
    cached_surface_y: Option<f32>,
    speed_factor: f32,
}

impl MovementState {
    fn new(
        entity_id: EntityId,
        target_position: Vec3,
        max_speed: f32,
        agent: &AgentConfig,
        waypoints: Vec<Vec3>,
        total_distance: f32,
        now: f32,
    ) -> Self {
        Self {
            entity_id,
            target_position,
            max_speed,
            agent_height: agent.height,
            agent_radius: agent.radius,
            waypoints,
            current_waypoint_index: 0,
            last_validation_time: now,
            last_replan_time: f32::NEG_INFINITY,
            start_time: now,
            total_distance,
            is_completed: false,
            is_avoiding_collision: false,
            has_detour_waypoint: false,
            edge_check_counter: 0,
            slope_grounding_counter: 0,
            blocked_validations: 0,
            cached_surface_y: None,
            speed_factor: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CharacterStatus {
    state: CharacterState,
    settle_timer: f32,
    recovery_timer: f32,
    airborne_grace: f32,
}

impl CharacterStatus {
    fn new(grounded: bool) -> Self {
        Self {
            state: if grounded {
                CharacterState::Grounded
            } else {
                CharacterState::Airborne
            },
            settle_timer: 0.0,
            recovery_timer: 0.0,
            airborne_grace: 0.0,
        }
    }
}

type EventListener = Box<dyn FnMut(&MovementEvent)>;

pub struct MotionOrchestrator {
    agent: AgentConfig,
    pathfinding: PathfindingConfig,
    motor: MotorCharacterConfig,
    movements: FxHashMap<EntityId, MovementState>,
    characters: FxHashMap<EntityId, CharacterStatus>,
    listener: Option<EventListener>,
    pending_events: Vec<MovementEvent>,
    time: f32,
}

impl MotionOrchestrator {
    pub fn new(
        agent: AgentConfig,
        pathfinding: PathfindingConfig,
        motor: MotorCharacterConfig,
    ) -> Self {
        Self {
            agent,
            pathfinding,
            motor,
            movements: FxHashMap::default(),
            characters: FxHashMap::default(),
            listener: None,
            pending_events: Vec::new(),
            time: 0.0,
        }
    }

    pub fn set_event_listener(&mut self, listener: impl FnMut(&MovementEvent) + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn agent_config(&self) -> &AgentConfig {
        &self.agent
    }

    fn agent_half_height(&self) -> f32 {
        self.agent.height / 2.0 + self.agent.radius
    }

    pub fn get_character_state(&self, id: EntityId) -> Option<CharacterState> {
        self.characters.get(&id).map(|c| c.state)
    }

    pub fn get_waypoints(&self, id: EntityId) -> Option<&[Vec3]> {
        self.movements.get(&id).map(|m| m.waypoints.as_slice())
    }

    pub fn get_current_waypoint_index(&self, id: EntityId) -> Option<usize> {
        self.movements.get(&id).map(|m| m.current_waypoint_index)
    }

    pub fn movement_state(&self, id: EntityId) -> Option<&MovementState> {
        self.movements.get(&id)
    }

    /// Plan a path and start moving. Fails synchronously (no events) when the
    /// target is unreachable or the entity is not a dynamic agent.
    pub fn request_movement(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        request: MovementRequest,
    ) -> Result<(), MotionError> {
        let id = request.entity_id;
        if !request.max_speed.is_finite() || request.max_speed <= 0.0 {
            return Err(MotionError::InvalidParameter("max_speed must be positive"));
        }
        if !request.target_position.is_finite() {
            return Err(MotionError::InvalidParameter("target must be finite"));
        }
        self.check_agent(world, id)?;

        let pose = world.get_pose(id)?;
        let waypoints =
            self.plan_waypoints(query, pose.position, request.target_position)?;
        let total_distance: f32 = waypoints.windows(2).map(|w| w[0].distance(w[1])).sum();

        let start = waypoints[0];
        let goal = *waypoints.last().unwrap_or(&request.target_position);
        self.movements.insert(
            id,
            MovementState::new(
                id,
                request.target_position,
                request.max_speed,
                &self.agent,
                waypoints,
                total_distance,
                self.time,
            ),
        );
        self.ensure_character(world, id);
        self.pending_events.push(MovementEvent::MovementStarted {
            id,
            start,
            goal,
        });
        self.flush_events();
        Ok(())
    }

    /// Snap, search, validate, auto-fix, and artefact-check a path.
    fn plan_waypoints(
        &self,
        query: &NavMeshQuery,
        from: Vec3,
        to: Vec3,
    ) -> Result<Vec<Vec3>, MotionError> {
        let extents = self.pathfinding.search_extents();
        let path = query.find_path(from, to, extents)?;

        let waypoints = match validate_path(&path.waypoints, &self.agent) {
            Ok(()) => path.waypoints,
            Err(violation) => match try_fix_path(&path.waypoints, &self.agent) {
                Some(fixed) => fixed,
                None => return Err(skarn_nav::NavError::from(violation).into()),
            },
        };

        if let Some((segment, reason)) = find_bridge_artefact(&waypoints) {
            warn!(segment, reason, "rejecting path with navmesh artefact");
            return Err(MotionError::Unreachable(reason));
        }
        Ok(waypoints)
    }

    /// Stops the agent, preserving vertical velocity. Idempotent.
    pub fn stop_movement(&mut self, world: &mut PhysicsWorld, id: EntityId) {
        if self.movements.remove(&id).is_none() {
            return;
        }
        if let Ok(velocity) = world.get_velocity(id) {
            let _ = world.set_velocity(id, Vec3::new(0.0, velocity.y, 0.0));
        }
    }

    /// Upward impulse; only a grounded agent can jump. Forces Airborne.
    pub fn jump(
        &mut self,
        world: &mut PhysicsWorld,
        id: EntityId,
        force: f32,
    ) -> Result<(), MotionError> {
        if !force.is_finite() || force <= 0.0 {
            return Err(MotionError::InvalidParameter("jump force must be positive"));
        }
        self.check_agent(world, id)?;
        let status = self.ensure_character(world, id);
        if status.state != CharacterState::Grounded {
            return Err(MotionError::NotGrounded(id));
        }
        world.apply_linear_impulse(id, Vec3::new(0.0, force, 0.0))?;
        self.force_airborne(id);
        Ok(())
    }

    /// Impulse along `direction`; forces Airborne, pausing path following
    /// until ground is regained.
    pub fn knockback(
        &mut self,
        world: &mut PhysicsWorld,
        id: EntityId,
        direction: Vec3,
        force: f32,
    ) -> Result<(), MotionError> {
        if !force.is_finite() || force <= 0.0 || !direction.is_finite() {
            return Err(MotionError::InvalidParameter(
                "knockback direction/force must be finite",
            ));
        }
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return Err(MotionError::InvalidParameter(
                "knockback direction must be non-zero",
            ));
        }
        self.check_agent(world, id)?;
        self.ensure_character(world, id);
        world.apply_linear_impulse(id, dir * force)?;
        self.force_airborne(id);
        Ok(())
    }

    /// Impulse without forcing Airborne. Optionally flips the pushable flag;
    /// `duration` is advisory, enforcement stays with the caller.
    pub fn push(
        &mut self,
        world: &mut PhysicsWorld,
        id: EntityId,
        direction: Vec3,
        force: f32,
        make_pushable: bool,
        _duration: Option<f32>,
    ) -> Result<(), MotionError> {
        if !force.is_finite() || force <= 0.0 || !direction.is_finite() {
            return Err(MotionError::InvalidParameter(
                "push direction/force must be finite",
            ));
        }
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return Err(MotionError::InvalidParameter(
                "push direction must be non-zero",
            ));
        }
        self.check_agent(world, id)?;
        self.ensure_character(world, id);
        if make_pushable {
            world.set_pushable(id, true)?;
        }
        world.apply_linear_impulse(id, dir * force)?;
        Ok(())
    }

    /// One movement tick. Call before `world.step(dt)` each frame with the
    /// same fixed `dt`.
    pub fn update(&mut self, world: &mut PhysicsWorld, query: &NavMeshQuery, dt: f32) {
        self.time += dt;

        // The world's ground tracking drives the character machines.
        for event in world.drain_ground_contact_events() {
            self.ensure_character(world, event.entity);
        }

        let regrounded = self.update_character_machines(world, dt);
        for id in regrounded {
            self.replan_from_current(world, query, id, true);
        }

        let mut ids: Vec<EntityId> = self.movements.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if !world.contains(id) {
                self.movements.remove(&id);
                self.characters.remove(&id);
                continue;
            }
            self.update_agent(world, query, id, dt);
        }

        self.flush_events();
    }

    fn update_character_machines(&mut self, world: &mut PhysicsWorld, dt: f32) -> Vec<EntityId> {
        let mut regrounded = Vec::new();
        let mut gone = Vec::new();

        let mut ids: Vec<EntityId> = self.characters.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if !world.contains(id) {
                gone.push(id);
                continue;
            }
            let contact = world.has_ground_contact(id);
            let vertical_speed = world.get_velocity(id).map(|v| v.y.abs()).unwrap_or(0.0);
            let Some(status) = self.characters.get_mut(&id) else {
                continue;
            };
            status.airborne_grace = (status.airborne_grace - dt).max(0.0);

            match status.state {
                CharacterState::Grounded => {
                    if !contact {
                        status.state = CharacterState::Airborne;
                    }
                }
                CharacterState::Airborne => {
                    if contact && status.airborne_grace <= 0.0 {
                        status.state = CharacterState::Recovering;
                        status.settle_timer = 0.0;
                        status.recovery_timer = 0.0;
                    }
                }
                CharacterState::Recovering => {
                    if !contact {
                        status.state = CharacterState::Airborne;
                    } else {
                        status.recovery_timer += dt;
                        if vertical_speed < SETTLE_SPEED {
                            status.settle_timer += dt;
                        } else {
                            status.settle_timer = 0.0;
                        }
                        if status.settle_timer >= STABILITY_WINDOW
                            || status.recovery_timer >= RECOVERY_TIMEOUT
                        {
                            status.state = CharacterState::Grounded;
                            regrounded.push(id);
                        }
                    }
                }
            }
        }

        for id in gone {
            self.characters.remove(&id);
            self.movements.remove(&id);
        }
        regrounded
    }

    fn update_agent(&mut self, world: &mut PhysicsWorld, query: &NavMeshQuery, id: EntityId, dt: f32) {
        let state = self
            .characters
            .get(&id)
            .map(|c| c.state)
            .unwrap_or(CharacterState::Grounded);
        let Ok(pose) = world.get_pose(id) else {
            return;
        };
        let Ok(velocity) = world.get_velocity(id) else {
            return;
        };

        match state {
            CharacterState::Airborne => {
                // Physics integrates; path following pauses.
            }
            CharacterState::Recovering => {
                self.apply_recovery(world, query, id, pose.position);
            }
            CharacterState::Grounded => {
                self.drive_grounded(world, query, id, pose, velocity, dt);
            }
        }
    }

    /// Half the vertical voxel size. Navmesh surface samples land on voxel
    /// tops, up to one cell height above the real geometry; subtracting half
    /// a cell centers that bias so height targets track the actual surface.
    /// Without it, an agent resting at its true height reads as "sunk" and
    /// the recovery impulse pumps it airborne.
    fn surface_bias(&self) -> f32 {
        self.agent.cell_height() * 0.5
    }

    /// Proportional upward impulse when the agent has settled below its
    /// target height. The deadband prevents recovery teleport loops.
    fn apply_recovery(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        id: EntityId,
        position: Vec3,
    ) {
        let Some(surface_y) = corrected_surface(query, position, self.surface_bias()) else {
            return;
        };
        let y_error = surface_y + self.agent_half_height() - position.y;
        if y_error > RECOVERY_DEADBAND {
            let _ = world.apply_linear_impulse(id, Vec3::new(0.0, y_error * RECOVERY_GAIN, 0.0));
        }
    }

    fn drive_grounded(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        id: EntityId,
        pose: RigidPose,
        velocity: Vec3,
        _dt: f32,
    ) {
        let position = pose.position;

        // Idle (completed or never-started) agents still hold their height.
        let Some(movement) = self.movements.get(&id) else {
            return;
        };
        if movement.is_completed {
            let surface_y = corrected_surface(query, position, self.surface_bias());
            let frame = motor::MotorFrame {
                position,
                velocity,
                target: None,
                effective_speed: 0.0,
                separation: Vec3::ZERO,
                surface_y,
                on_slope: false,
            };
            let v = motor::drive(&frame, &self.motor, self.agent_half_height());
            let _ = world.set_velocity(id, v);
            return;
        }

        self.progress_waypoints(world, id, position);
        let Some(movement) = self.movements.get(&id) else {
            return;
        };
        if movement.is_completed {
            return;
        }

        self.revalidate_if_due(world, query, id, position);
        let Some(movement) = self.movements.get(&id) else {
            // Revalidation may have stopped the agent.
            return;
        };
        let Some(&target) = movement.waypoints.get(movement.current_waypoint_index) else {
            return;
        };

        let separation = if self.pathfinding.enable_local_avoidance {
            self.resolve_avoidance(world, query, id, position, velocity, target)
        } else {
            Vec3::ZERO
        };

        let half_height = self.agent_half_height();
        let surface_bias = self.surface_bias();

        // The detour pass may have changed the current waypoint.
        let Some(movement) = self.movements.get_mut(&id) else {
            return;
        };
        let target = movement.waypoints[movement.current_waypoint_index
            .min(movement.waypoints.len() - 1)];

        // Slope-aware grounding: on ramps, requery every few steps with a
        // tighter band instead of every step. Waypoints lie on the surface,
        // so compare against the agent's foot height.
        let foot_y = position.y - half_height;
        let delta_y = (target.y - foot_y).abs();
        let horizontal = horizontal_distance(position, target);
        let on_slope = delta_y > SLOPE_DELTA_Y && horizontal > 0.1;
        let surface_y = if on_slope {
            movement.slope_grounding_counter = movement.slope_grounding_counter.wrapping_add(1);
            if movement.slope_grounding_counter % SLOPE_GROUNDING_PERIOD == 1
                || movement.cached_surface_y.is_none()
            {
                movement.cached_surface_y = corrected_surface(query, position, surface_bias);
            }
            movement.cached_surface_y
        } else {
            movement.slope_grounding_counter = 0;
            let sampled = corrected_surface(query, position, surface_bias);
            movement.cached_surface_y = sampled;
            sampled
        };

        let frame = motor::MotorFrame {
            position,
            velocity,
            target: Some(target),
            effective_speed: movement.max_speed * movement.speed_factor,
            separation,
            surface_y,
            on_slope,
        };
        let commanded = motor::drive(&frame, &self.motor, half_height);
        let _ = world.set_velocity(id, commanded);

        // Face the direction of intended travel.
        if let Some(rotation) = motor::facing_from_motion(flatten(target - position)) {
            let _ = world.set_pose(
                id,
                RigidPose {
                    position,
                    rotation,
                },
            );
        }
    }

    /// Advance the waypoint index; thresholds are inclusive and measured on
    /// XZ only. Completion fires `DestinationReached` exactly once.
    fn progress_waypoints(&mut self, world: &mut PhysicsWorld, id: EntityId, position: Vec3) {
        let Some(movement) = self.movements.get_mut(&id) else {
            return;
        };
        let count = movement.waypoints.len();
        if count == 0 {
            return;
        }
        let previous_index = movement.current_waypoint_index;
        let mut completed = false;

        loop {
            let index = movement.current_waypoint_index;
            if index >= count {
                completed = true;
                break;
            }
            let target = movement.waypoints[index];
            let is_last = index == count - 1;
            let threshold = if is_last {
                self.pathfinding.destination_reached_threshold
            } else {
                self.pathfinding.waypoint_reached_threshold
            };
            if horizontal_distance(position, target) > threshold {
                break;
            }
            if is_last {
                completed = true;
                break;
            }
            // Skip forward past waypoints that share our XZ.
            let mut next = index + 1;
            while next < count
                && horizontal_distance(position, movement.waypoints[next]) <= WAYPOINT_SKIP_DISTANCE
            {
                next += 1;
            }
            movement.current_waypoint_index = next;
            movement.has_detour_waypoint = false;
        }

        if completed && !movement.is_completed {
            movement.is_completed = true;
            movement.current_waypoint_index = count.saturating_sub(1);
            if let Ok(velocity) = world.get_velocity(id) {
                let _ = world.set_velocity(id, Vec3::new(0.0, velocity.y, 0.0));
            }
            debug!(id, elapsed = self.time - movement.start_time, "destination reached");
            self.pending_events.push(MovementEvent::DestinationReached {
                id,
                final_position: position,
            });
        } else if movement.current_waypoint_index != previous_index {
            let fraction =
                (movement.current_waypoint_index as f32 / count as f32).clamp(0.0, 1.0);
            self.pending_events
                .push(MovementEvent::MovementProgress { id, fraction });
        }
    }

    /// Periodic revalidation of the remaining path, plus a cheap edge probe
    /// of the current target every few steps.
    fn revalidate_if_due(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        id: EntityId,
        position: Vec3,
    ) {
        let Some(movement) = self.movements.get_mut(&id) else {
            return;
        };

        movement.edge_check_counter = movement.edge_check_counter.wrapping_add(1);
        let edge_check_due = movement.edge_check_counter % EDGE_CHECK_PERIOD == 0;
        let validation_due =
            self.time - movement.last_validation_time >= self.pathfinding.path_validation_interval;
        if !validation_due && !edge_check_due {
            return;
        }

        let blocked = if validation_due {
            movement.last_validation_time = self.time;
            movement.waypoints[movement.current_waypoint_index..]
                .iter()
                .find(|wp| waypoint_blocked(world, query, **wp, self.agent.radius))
                .copied()
        } else {
            let target = movement.waypoints[movement
                .current_waypoint_index
                .min(movement.waypoints.len() - 1)];
            waypoint_blocked(world, query, target, self.agent.radius).then_some(target)
        };

        let Some(blocked_at) = blocked else {
            if validation_due {
                if let Some(movement) = self.movements.get_mut(&id) {
                    movement.blocked_validations = 0;
                    if !movement.has_detour_waypoint {
                        movement.is_avoiding_collision = false;
                    }
                }
            }
            return;
        };

        self.pending_events.push(MovementEvent::PathBlocked { id });

        // Temporary blockages (temporary obstacles or pushable bodies near
        // the waypoint) get a chance to resolve through local avoidance
        // before we spend a replan.
        let temporary = world.has_entities_in_radius(
            blocked_at,
            self.agent.radius + 1.0,
            Some(EntityTypes::TEMPORARY_OBSTACLE),
        );

        let movement = match self.movements.get_mut(&id) {
            Some(m) => m,
            None => return,
        };
        movement.blocked_validations += 1;
        let avoidance_first = temporary
            && self.pathfinding.try_local_avoidance_first
            && self.pathfinding.enable_local_avoidance
            && movement.blocked_validations < MAX_BLOCKED_VALIDATIONS;

        if avoidance_first {
            movement.is_avoiding_collision = true;
            debug!(id, "temporary blockage: trying local avoidance first");
            return;
        }

        self.replan_from_current(world, query, id, false);
    }

    /// Replan from the current position toward the standing target. When
    /// `bypass_cooldown` (recovery re-issue), the cooldown is ignored.
    fn replan_from_current(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        id: EntityId,
        bypass_cooldown: bool,
    ) {
        let Some(movement) = self.movements.get(&id) else {
            return;
        };
        if movement.is_completed {
            return;
        }
        if !self.pathfinding.enable_automatic_replanning {
            self.stop_movement(world, id);
            return;
        }
        if !bypass_cooldown
            && self.time - movement.last_replan_time < self.pathfinding.replan_cooldown
        {
            return;
        }
        let target = movement.target_position;
        let Ok(pose) = world.get_pose(id) else {
            return;
        };

        match self.plan_waypoints(query, pose.position, target) {
            Ok(waypoints) => {
                if let Some(movement) = self.movements.get_mut(&id) {
                    movement.total_distance =
                        waypoints.windows(2).map(|w| w[0].distance(w[1])).sum();
                    movement.waypoints = waypoints;
                    movement.current_waypoint_index = 0;
                    movement.has_detour_waypoint = false;
                    movement.is_avoiding_collision = false;
                    movement.blocked_validations = 0;
                    movement.last_replan_time = self.time;
                }
                self.pending_events.push(MovementEvent::PathReplanned { id });
            }
            Err(error) => {
                warn!(id, %error, "replan failed; stopping agent");
                self.stop_movement(world, id);
            }
        }
    }

    /// Collision prediction against nearby agents. Returns the separation
    /// steering to blend into the motor (zero on critical ticks).
    fn resolve_avoidance(
        &mut self,
        world: &mut PhysicsWorld,
        query: &NavMeshQuery,
        id: EntityId,
        position: Vec3,
        velocity: Vec3,
        target: Vec3,
    ) -> Vec3 {
        let Some(movement) = self.movements.get(&id) else {
            return Vec3::ZERO;
        };
        let max_speed = movement.max_speed;
        let radius = movement.agent_radius;

        let mut neighbours: Vec<(EntityId, Vec3, Vec3)> = world
            .entities_in_radius(
                position,
                self.pathfinding.local_avoidance_radius,
                Some(EntityTypes::AGENTS),
            )
            .into_iter()
            .filter(|&other| other != id)
            .filter_map(|other| {
                let pose = world.get_pose(other).ok()?;
                let vel = world.get_velocity(other).ok()?;
                Some((other, pose.position, vel))
            })
            .collect();
        neighbours.sort_by(|a, b| {
            skarn_geom::horizontal_distance_sq(a.1, position)
                .total_cmp(&skarn_geom::horizontal_distance_sq(b.1, position))
                .then(a.0.cmp(&b.0))
        });
        neighbours.truncate(self.pathfinding.max_avoidance_neighbors);
        if neighbours.is_empty() {
            if let Some(movement) = self.movements.get_mut(&id) {
                movement.speed_factor = 1.0;
            }
            return Vec3::ZERO;
        }

        // Intent velocity: projected toward the current waypoint.
        let intent = flatten(target - position).normalize_or_zero() * max_speed;

        let mut critical: Option<(EntityId, Vec3)> = None;
        for (other, other_pos, other_vel) in &neighbours {
            let approach = avoidance::predict_closest_approach(
                position,
                intent,
                *other_pos,
                *other_vel,
            );
            if avoidance::is_critical(&approach, radius, radius) {
                critical = Some((*other, *other_pos));
                break;
            }
        }

        let Some(movement) = self.movements.get_mut(&id) else {
            return Vec3::ZERO;
        };

        if let Some((other, other_pos)) = critical {
            movement.is_avoiding_collision = true;
            if id < other {
                // Yielder: one perpendicular detour, navmesh-clamped.
                movement.speed_factor = 1.0;
                if !movement.has_detour_waypoint {
                    let travel = target - position;
                    let raw_detour = avoidance::detour_point(travel, other_pos);
                    let clamp_extents = Vec3::new(2.0, 3.0, 2.0);
                    if let Ok((_, snapped)) =
                        query.nearest_walkable_polygon(raw_detour, clamp_extents)
                    {
                        // Keep the current segment's target height so a bad
                        // snap cannot launch the agent vertically.
                        let detour = Vec3::new(snapped.x, target.y, snapped.z);
                        let index = movement.current_waypoint_index;
                        movement.waypoints.insert(index, detour);
                        movement.has_detour_waypoint = true;
                        debug!(id, other, "inserted avoidance detour");
                    }
                }
            } else {
                // Higher id holds its path and slows while the threat lasts.
                movement.speed_factor = avoidance::THREAT_SPEED_FACTOR;
            }
            // Steering would double-count the critical response.
            return Vec3::ZERO;
        }

        movement.speed_factor = 1.0;
        if !movement.has_detour_waypoint {
            movement.is_avoiding_collision = false;
        }
        let positions: Vec<(EntityId, Vec3)> = neighbours
            .iter()
            .map(|(other, pos, _)| (*other, *pos))
            .collect();
        avoidance::separation_velocity(
            position,
            &positions,
            self.pathfinding.separation_radius,
            self.pathfinding.avoidance_strength,
        )
    }

    fn check_agent(&self, world: &PhysicsWorld, id: EntityId) -> Result<(), MotionError> {
        let Some(entity_type) = world.entity_type_of(id) else {
            return Err(MotionError::EntityNotFound(id));
        };
        let dynamic = world.mobility_of(id) == Some(skarn_physics::Mobility::Dynamic);
        if !entity_type.is_agent() || !dynamic {
            return Err(MotionError::NotAnAgent(id));
        }
        Ok(())
    }

    fn ensure_character(&mut self, world: &PhysicsWorld, id: EntityId) -> CharacterStatus {
        *self
            .characters
            .entry(id)
            .or_insert_with(|| CharacterStatus::new(world.has_ground_contact(id)))
    }

    fn force_airborne(&mut self, id: EntityId) {
        if let Some(status) = self.characters.get_mut(&id) {
            status.state = CharacterState::Airborne;
            status.settle_timer = 0.0;
            status.airborne_grace = AIRBORNE_GRACE;
        }
    }

    fn flush_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending_events);
        if let Some(listener) = self.listener.as_mut() {
            for event in &events {
                listener(event);
            }
        }
    }
}

/// Navmesh surface height at the agent's XZ, with the voxel-top sampling
/// bias removed (see [`MotionOrchestrator::surface_bias`]).
fn corrected_surface(query: &NavMeshQuery, position: Vec3, bias: f32) -> Option<f32> {
    query
        .sample_surface_height(position, GROUNDING_EXTENTS)
        .map(|y| y - bias)
}

/// A waypoint is blocked when it no longer snaps to the navmesh or a
/// temporary obstacle body sits on it.
fn waypoint_blocked(
    world: &PhysicsWorld,
    query: &NavMeshQuery,
    waypoint: Vec3,
    agent_radius: f32,
) -> bool {
    if query
        .nearest_walkable_polygon(waypoint, Vec3::new(1.0, 2.0, 1.0))
        .is_err()
    {
        return true;
    }
    world.has_entities_in_radius(
        waypoint,
        agent_radius + 0.5,
        Some(EntityTypes::OBSTACLE | EntityTypes::TEMPORARY_OBSTACLE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use skarn_nav::{build_navmesh, TriangleInput};
    use skarn_physics::{EntityType, Mobility, PhysicsConfig, ShapeDesc};
    use std::sync::Arc;

    fn flat_world() -> (PhysicsWorld, NavMeshQuery) {
        let mut world = PhysicsWorld::new(PhysicsConfig::default());
        world
            .register_body(
                1000,
                EntityType::StaticObject,
                RigidPose::from_position(Vec3::new(0.0, -0.05, 0.0)),
                ShapeDesc::Box {
                    half_extents: Vec3::new(20.0, 0.05, 20.0),
                },
                Mobility::Static,
                None,
                false,
            )
            .unwrap();
        let (positions, indices) = world.static_geometry();
        let input = TriangleInput {
            positions: &positions,
            indices: &indices,
            areas: None,
        };
        let mesh = build_navmesh(&input, &AgentConfig::default()).unwrap();
        (world, NavMeshQuery::new(Arc::new(mesh)))
    }

    fn orchestrator() -> MotionOrchestrator {
        MotionOrchestrator::new(
            AgentConfig::default(),
            PathfindingConfig::default(),
            MotorCharacterConfig::default(),
        )
    }

    fn spawn_agent(world: &mut PhysicsWorld, id: EntityId, position: Vec3) {
        world
            .register_body(
                id,
                EntityType::Npc,
                RigidPose::from_position(position),
                ShapeDesc::Capsule {
                    radius: 0.5,
                    half_height: 0.9,
                },
                Mobility::Dynamic,
                Some(1.0),
                false,
            )
            .unwrap();
    }

    #[test]
    fn request_movement_rejects_non_agents() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        let err = orch.request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 1000,
                target_position: Vec3::new(5.0, 0.0, 0.0),
                max_speed: 3.0,
            },
        );
        assert!(matches!(err, Err(MotionError::NotAnAgent(1000))));

        let err = orch.request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 42,
                target_position: Vec3::new(5.0, 0.0, 0.0),
                max_speed: 3.0,
            },
        );
        assert!(matches!(err, Err(MotionError::EntityNotFound(42))));
    }

    #[test]
    fn request_movement_creates_state_and_event() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        spawn_agent(&mut world, 1, Vec3::new(-5.0, 1.4, 0.0));

        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = events.clone();
        orch.set_event_listener(move |e| sink.borrow_mut().push(e.clone()));

        orch.request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 1,
                target_position: Vec3::new(5.0, 1.4, 0.0),
                max_speed: 3.0,
            },
        )
        .unwrap();

        assert!(orch.get_waypoints(1).is_some());
        assert_eq!(orch.get_current_waypoint_index(1), Some(0));
        let events = events.borrow();
        assert!(matches!(
            events.first(),
            Some(MovementEvent::MovementStarted { id: 1, .. })
        ));
    }

    #[test]
    fn stop_movement_is_idempotent_and_preserves_vertical_velocity() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        spawn_agent(&mut world, 1, Vec3::new(0.0, 1.4, 0.0));
        orch.request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 1,
                target_position: Vec3::new(5.0, 1.4, 0.0),
                max_speed: 3.0,
            },
        )
        .unwrap();

        world.set_velocity(1, Vec3::new(2.0, -1.5, 2.0)).unwrap();
        orch.stop_movement(&mut world, 1);
        let v = world.get_velocity(1).unwrap();
        assert_eq!(v.x, 0.0);
        assert_eq!(v.z, 0.0);
        assert_eq!(v.y, -1.5);
        assert!(orch.get_waypoints(1).is_none());

        // Second stop touches nothing.
        world.set_velocity(1, Vec3::new(2.0, 0.0, 0.0)).unwrap();
        orch.stop_movement(&mut world, 1);
        assert_eq!(world.get_velocity(1).unwrap().x, 2.0);
    }

    #[test]
    fn jump_requires_ground() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        spawn_agent(&mut world, 1, Vec3::new(0.0, 5.0, 0.0));
        // Never stepped: no ground contact, agent reads Airborne.
        let dt = world.timestep();
        orch.update(&mut world, &query, dt);
        assert!(matches!(
            orch.jump(&mut world, 1, 5.0),
            Err(MotionError::NotGrounded(1))
        ));
    }

    #[test]
    fn grounded_after_settling_then_jump_goes_airborne() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        spawn_agent(&mut world, 1, Vec3::new(0.0, 1.45, 0.0));
        let dt = world.timestep();

        for _ in 0..120 {
            orch.update(&mut world, &query, dt);
            world.step(dt).unwrap();
        }
        assert_eq!(orch.get_character_state(1), Some(CharacterState::Grounded));

        orch.jump(&mut world, 1, 5.0).unwrap();
        assert_eq!(orch.get_character_state(1), Some(CharacterState::Airborne));
    }

    #[test]
    fn movement_state_fields_initialised() {
        let (mut world, query) = flat_world();
        let mut orch = orchestrator();
        spawn_agent(&mut world, 7, Vec3::new(-3.0, 1.4, 0.0));
        orch.request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 7,
                target_position: Vec3::new(4.0, 1.4, 2.0),
                max_speed: 2.0,
            },
        )
        .unwrap();

        let state = orch.movement_state(7).unwrap();
        assert_eq!(state.entity_id, 7);
        assert!(!state.is_completed);
        assert!(!state.has_detour_waypoint);
        assert!(state.total_distance > 6.0);
        assert!(state.waypoints.len() >= 2);
        assert_eq!(state.agent_radius, 0.5);
    }
}
