//! Server-authoritative rigid-body world.
//!
//! Wraps rapier3d with an entity registry keyed by stable 32-bit ids, an
//! interned shape store, fixed-timestep stepping, contact material shaping
//! (see [`materials`]), collision/ground-contact event plumbing, and the
//! spatial queries the movement layer leans on.
//!
//! Determinism: a world stepped with the same configuration and the same
//! sequence of public mutations produces identical poses and velocities on
//! the same platform. Registries iterate in id order everywhere iteration
//! feeds simulation-visible results.

use glam::{Quat, Vec3};
use rapier3d::na;
use rapier3d::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod materials;
mod hooks;

pub use materials::{PairClass, PairMaterialProperties};

/// Stable identifier assigned by the host. Never reused while registered.
pub type EntityId = u32;

/// Separation below which a narrow-phase pair still counts as ground support.
const GROUND_SUPPORT_SLACK: f32 = 0.12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityType {
    Player = 0,
    Npc = 1,
    StaticObject = 2,
    Obstacle = 3,
    Projectile = 4,
    Enemy = 5,
    TemporaryObstacle = 6,
}

impl EntityType {
    pub fn is_agent(self) -> bool {
        matches!(self, EntityType::Player | EntityType::Npc | EntityType::Enemy)
    }

    fn bit(self) -> EntityTypes {
        match self {
            EntityType::Player => EntityTypes::PLAYER,
            EntityType::Npc => EntityTypes::NPC,
            EntityType::StaticObject => EntityTypes::STATIC_OBJECT,
            EntityType::Obstacle => EntityTypes::OBSTACLE,
            EntityType::Projectile => EntityTypes::PROJECTILE,
            EntityType::Enemy => EntityTypes::ENEMY,
            EntityType::TemporaryObstacle => EntityTypes::TEMPORARY_OBSTACLE,
        }
    }
}

bitflags::bitflags! {
    /// Type filter for spatial queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntityTypes: u8 {
        const PLAYER             = 0b0000001;
        const NPC                = 0b0000010;
        const STATIC_OBJECT      = 0b0000100;
        const OBSTACLE           = 0b0001000;
        const PROJECTILE         = 0b0010000;
        const ENEMY              = 0b0100000;
        const TEMPORARY_OBSTACLE = 0b1000000;
        const AGENTS = Self::PLAYER.bits() | Self::NPC.bits() | Self::ENEMY.bits();
    }
}

/// A body is either static or dynamic for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mobility {
    Static,
    Dynamic,
}

/// Value-type collision shape. Shapes are interned; many bodies may share one
/// store entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShapeDesc {
    Box { half_extents: Vec3 },
    Capsule { radius: f32, half_height: f32 },
    Sphere { radius: f32 },
}

/// Index into the world's append-only shape store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeHandle(pub u32);

/// Position and orientation of a body.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidPose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl RigidPose {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

/// Handle returned by [`PhysicsWorld::register_body`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyHandle {
    id: EntityId,
    raw: RigidBodyHandle,
}

impl BodyHandle {
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The underlying rapier body handle, for hosts that drop down to the
    /// rapier API directly.
    pub fn raw(&self) -> RigidBodyHandle {
        self.raw
    }
}

impl From<BodyHandle> for EntityId {
    fn from(handle: BodyHandle) -> Self {
        handle.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PhysicsError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("entity id {0} is already registered")]
    DuplicateEntityId(EntityId),
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
    /// Fixed timestep; `step` rejects any other dt.
    pub timestep: f32,
    pub solver_iterations: usize,
    /// Minimum simulated time between collision events for the same pair.
    pub collision_event_cooldown: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            timestep: 0.008,
            solver_iterations: 4,
            collision_event_cooldown: 0.5,
        }
    }
}

/// Emitted when a new contact pair forms (per-pair cooldown applies).
#[derive(Clone, Copy, Debug)]
pub struct CollisionEvent {
    pub a: EntityId,
    pub b: EntityId,
    pub contact_point: Vec3,
    pub normal_from_a_to_b: Vec3,
    pub penetration_depth: f32,
}

/// Entry/exit of static-geometry support for a dynamic agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroundContactEvent {
    pub entity: EntityId,
    pub grounded: bool,
}

struct BodyRecord {
    raw: RigidBodyHandle,
    collider: ColliderHandle,
    entity_type: EntityType,
    mobility: Mobility,
    shape: ShapeHandle,
    pushable: bool,
}

/// Append-only interned shape pool.
#[derive(Default)]
struct ShapeStore {
    descs: Vec<ShapeDesc>,
    shared: Vec<SharedShape>,
}

impl ShapeStore {
    fn intern(&mut self, desc: ShapeDesc) -> ShapeHandle {
        if let Some(i) = self.descs.iter().position(|d| *d == desc) {
            return ShapeHandle(i as u32);
        }
        let shared = match desc {
            ShapeDesc::Box { half_extents } => {
                SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z)
            }
            ShapeDesc::Capsule {
                radius,
                half_height,
            } => SharedShape::capsule_y(half_height, radius),
            ShapeDesc::Sphere { radius } => SharedShape::ball(radius),
        };
        self.descs.push(desc);
        self.shared.push(shared);
        ShapeHandle(self.descs.len() as u32 - 1)
    }

    fn desc(&self, handle: ShapeHandle) -> &ShapeDesc {
        &self.descs[handle.0 as usize]
    }

    fn shared(&self, handle: ShapeHandle) -> &SharedShape {
        &self.shared[handle.0 as usize]
    }
}

type CollisionListener = Box<dyn FnMut(&CollisionEvent)>;

pub struct PhysicsWorld {
    pub bodies: RigidBodySet,
    pub colliders: ColliderSet,
    joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration: IntegrationParameters,
    island_mgr: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    query_pipeline: QueryPipeline,
    ccd: CCDSolver,
    event_handler: ChannelEventCollector,
    collision_recv: rapier3d::crossbeam::channel::Receiver<rapier3d::prelude::CollisionEvent>,
    contact_force_recv: rapier3d::crossbeam::channel::Receiver<ContactForceEvent>,
    material_hooks: hooks::MaterialHooks,

    config: PhysicsConfig,
    registry: FxHashMap<EntityId, BodyRecord>,
    static_ids: Vec<EntityId>,
    dynamic_ids: Vec<EntityId>,
    shapes: ShapeStore,

    time: f32,
    collision_listener: Option<CollisionListener>,
    pair_cooldowns: FxHashMap<(EntityId, EntityId), f32>,
    grounded_agents: Vec<EntityId>,
    ground_events: Vec<GroundContactEvent>,
}

impl PhysicsWorld {
    pub fn new(config: PhysicsConfig) -> Self {
        let (collision_send, collision_recv) = rapier3d::crossbeam::channel::unbounded();
        let (contact_force_send, contact_force_recv) = rapier3d::crossbeam::channel::unbounded();
        let event_handler = ChannelEventCollector::new(collision_send, contact_force_send);

        let mut integration = IntegrationParameters {
            dt: config.timestep,
            ..Default::default()
        };
        // Grounded agents rest on the stiff ground-pair spring; per-pair
        // friction/recovery/margin are applied in the modification hook.
        let ground = materials::properties_for(PairClass::AgentGround);
        integration.contact_natural_frequency = ground.spring_frequency_hz;
        integration.contact_damping_ratio = ground.spring_damping_ratio;
        if let Some(n) = std::num::NonZeroUsize::new(config.solver_iterations) {
            integration.num_solver_iterations = n;
        }

        Self {
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            pipeline: PhysicsPipeline::new(),
            gravity: vector![config.gravity.x, config.gravity.y, config.gravity.z],
            integration,
            island_mgr: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            query_pipeline: QueryPipeline::new(),
            ccd: CCDSolver::new(),
            event_handler,
            collision_recv,
            contact_force_recv,
            material_hooks: hooks::MaterialHooks,
            config,
            registry: FxHashMap::default(),
            static_ids: Vec::new(),
            dynamic_ids: Vec::new(),
            shapes: ShapeStore::default(),
            time: 0.0,
            collision_listener: None,
            pair_cooldowns: FxHashMap::default(),
            grounded_agents: Vec::new(),
            ground_events: Vec::new(),
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn timestep(&self) -> f32 {
        self.config.timestep
    }

    /// Accumulated simulated time.
    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn set_collision_listener(&mut self, listener: impl FnMut(&CollisionEvent) + 'static) {
        self.collision_listener = Some(Box::new(listener));
    }

    pub fn register_body(
        &mut self,
        entity_id: EntityId,
        entity_type: EntityType,
        pose: RigidPose,
        shape: ShapeDesc,
        mobility: Mobility,
        mass: Option<f32>,
        disable_gravity: bool,
    ) -> Result<BodyHandle, PhysicsError> {
        if self.registry.contains_key(&entity_id) {
            return Err(PhysicsError::DuplicateEntityId(entity_id));
        }
        if !pose.position.is_finite() || !pose.rotation.is_finite() {
            return Err(PhysicsError::InvalidParameter("pose must be finite"));
        }
        validate_shape(&shape)?;
        let mass = match (mobility, mass) {
            (Mobility::Static, _) => 1.0,
            (Mobility::Dynamic, Some(m)) if m.is_finite() && m > 0.0 => m,
            (Mobility::Dynamic, Some(_)) => {
                return Err(PhysicsError::InvalidParameter(
                    "mass must be positive and finite",
                ))
            }
            (Mobility::Dynamic, None) => 1.0,
        };

        let shape_handle = self.shapes.intern(shape);
        let ground_like =
            mobility == Mobility::Static && materials::is_ground_like_shape(&shape);
        let user_data = hooks::encode_meta(entity_id, entity_type, mobility, false, ground_like);

        let mut builder = match mobility {
            Mobility::Static => RigidBodyBuilder::fixed(),
            Mobility::Dynamic => RigidBodyBuilder::dynamic(),
        }
        .position(to_iso(&pose))
        .user_data(user_data);
        if disable_gravity {
            builder = builder.gravity_scale(0.0);
        }
        // Agents are upright capsules driven by a motor; free rotation only
        // destabilizes them.
        if mobility == Mobility::Dynamic && entity_type.is_agent() {
            builder = builder.lock_rotations();
        }
        let raw = self.bodies.insert(builder.build());

        let collider = ColliderBuilder::new(self.shapes.shared(shape_handle).clone())
            .mass(mass)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .active_hooks(ActiveHooks::MODIFY_SOLVER_CONTACTS)
            .user_data(user_data)
            .build();
        let collider = self.colliders.insert_with_parent(collider, raw, &mut self.bodies);

        self.registry.insert(
            entity_id,
            BodyRecord {
                raw,
                collider,
                entity_type,
                mobility,
                shape: shape_handle,
                pushable: false,
            },
        );
        match mobility {
            Mobility::Static => insert_sorted(&mut self.static_ids, entity_id),
            Mobility::Dynamic => insert_sorted(&mut self.dynamic_ids, entity_id),
        }

        Ok(BodyHandle {
            id: entity_id,
            raw,
        })
    }

    /// Removes the body. Idempotent: unknown ids are ignored.
    pub fn unregister_body(&mut self, id: EntityId) {
        let Some(record) = self.registry.remove(&id) else {
            return;
        };
        self.bodies.remove(
            record.raw,
            &mut self.island_mgr,
            &mut self.colliders,
            &mut self.joints,
            &mut self.multibody_joints,
            true,
        );
        match record.mobility {
            Mobility::Static => remove_sorted(&mut self.static_ids, id),
            Mobility::Dynamic => remove_sorted(&mut self.dynamic_ids, id),
        }
        if let Ok(i) = self.grounded_agents.binary_search(&id) {
            self.grounded_agents.remove(i);
        }
        self.pair_cooldowns
            .retain(|(a, b), _| *a != id && *b != id);
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.registry.contains_key(&id)
    }

    pub fn handle_of(&self, id: EntityId) -> Option<BodyHandle> {
        self.registry
            .get(&id)
            .map(|record| BodyHandle { id, raw: record.raw })
    }

    pub fn entity_type_of(&self, id: EntityId) -> Option<EntityType> {
        self.registry.get(&id).map(|r| r.entity_type)
    }

    pub fn mobility_of(&self, id: EntityId) -> Option<Mobility> {
        self.registry.get(&id).map(|r| r.mobility)
    }

    pub fn shape_of(&self, id: EntityId) -> Option<ShapeDesc> {
        self.registry.get(&id).map(|r| *self.shapes.desc(r.shape))
    }

    pub fn get_pose(&self, id: EntityId) -> Result<RigidPose, PhysicsError> {
        let record = self.record(id)?;
        let rb = self
            .bodies
            .get(record.raw)
            .ok_or(PhysicsError::EntityNotFound(id))?;
        Ok(from_iso(rb.position()))
    }

    /// Static poses may only be mutated between simulation steps.
    pub fn set_pose(&mut self, id: EntityId, pose: RigidPose) -> Result<(), PhysicsError> {
        if !pose.position.is_finite() || !pose.rotation.is_finite() {
            return Err(PhysicsError::InvalidParameter("pose must be finite"));
        }
        let record = self.record(id)?;
        if let Some(rb) = self.bodies.get_mut(record.raw) {
            rb.set_position(to_iso(&pose), true);
        }
        Ok(())
    }

    pub fn get_velocity(&self, id: EntityId) -> Result<Vec3, PhysicsError> {
        let record = self.record(id)?;
        let rb = self
            .bodies
            .get(record.raw)
            .ok_or(PhysicsError::EntityNotFound(id))?;
        let v = rb.linvel();
        Ok(Vec3::new(v.x, v.y, v.z))
    }

    /// Also wakes the body so a sleeping body responds to commanded motion on
    /// the next step.
    pub fn set_velocity(&mut self, id: EntityId, velocity: Vec3) -> Result<(), PhysicsError> {
        if !velocity.is_finite() {
            return Err(PhysicsError::InvalidParameter("velocity must be finite"));
        }
        let record = self.record(id)?;
        if let Some(rb) = self.bodies.get_mut(record.raw) {
            rb.set_linvel(vector![velocity.x, velocity.y, velocity.z], true);
        }
        Ok(())
    }

    /// No-op on static bodies.
    pub fn apply_linear_impulse(&mut self, id: EntityId, impulse: Vec3) -> Result<(), PhysicsError> {
        if !impulse.is_finite() {
            return Err(PhysicsError::InvalidParameter("impulse must be finite"));
        }
        let record = self.record(id)?;
        if record.mobility == Mobility::Static {
            return Ok(());
        }
        if let Some(rb) = self.bodies.get_mut(record.raw) {
            rb.apply_impulse(vector![impulse.x, impulse.y, impulse.z], true);
        }
        Ok(())
    }

    pub fn is_pushable(&self, id: EntityId) -> bool {
        self.registry.get(&id).map(|r| r.pushable).unwrap_or(false)
    }

    /// Flips the pushable flag. Contacts already in the solver keep the
    /// material they were formed with; pairs shaped on the next step observe
    /// the new flag.
    pub fn set_pushable(&mut self, id: EntityId, pushable: bool) -> Result<(), PhysicsError> {
        let record = self
            .registry
            .get_mut(&id)
            .ok_or(PhysicsError::EntityNotFound(id))?;
        record.pushable = pushable;
        let collider = record.collider;
        let raw = record.raw;
        if let Some(c) = self.colliders.get_mut(collider) {
            c.user_data = hooks::set_pushable_bit(c.user_data, pushable);
        }
        if let Some(rb) = self.bodies.get_mut(raw) {
            rb.user_data = hooks::set_pushable_bit(rb.user_data, pushable);
        }
        Ok(())
    }

    /// Advances exactly one fixed timestep. `dt` must equal the configured
    /// timestep; callers that fall behind issue multiple steps.
    pub fn step(&mut self, dt: f32) -> Result<(), PhysicsError> {
        if !dt.is_finite() || (dt - self.config.timestep).abs() > 1e-9 {
            return Err(PhysicsError::InvalidParameter(
                "dt must equal the configured fixed timestep",
            ));
        }

        self.pipeline.step(
            &self.gravity,
            &self.integration,
            &mut self.island_mgr,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.joints,
            &mut self.multibody_joints,
            &mut self.ccd,
            Some(&mut self.query_pipeline),
            &self.material_hooks,
            &self.event_handler,
        );
        // Keep scene queries in sync with the stepped geometry.
        self.query_pipeline.update(&self.colliders);

        self.time += dt;
        self.dispatch_collision_events();
        self.refresh_ground_contacts();
        Ok(())
    }

    fn dispatch_collision_events(&mut self) {
        while let Ok(event) = self.collision_recv.try_recv() {
            let rapier3d::prelude::CollisionEvent::Started(c1, c2, _) = event else {
                continue;
            };
            let (Some(a), Some(b)) = (self.entity_of_collider(c1), self.entity_of_collider(c2))
            else {
                continue;
            };

            let key = if a < b { (a, b) } else { (b, a) };
            let cooldown = self.config.collision_event_cooldown;
            if let Some(last) = self.pair_cooldowns.get(&key) {
                if self.time - *last < cooldown {
                    continue;
                }
            }

            let Some(pair) = self.narrow_phase.contact_pair(c1, c2) else {
                continue;
            };
            let Some((manifold, contact)) = pair.find_deepest_contact() else {
                continue;
            };
            let swapped = pair.collider1 != c1;
            let normal = if swapped {
                -manifold.data.normal
            } else {
                manifold.data.normal
            };
            let contact_point = self
                .colliders
                .get(c1)
                .map(|c| {
                    let p = if swapped {
                        c.position() * contact.local_p2
                    } else {
                        c.position() * contact.local_p1
                    };
                    Vec3::new(p.x, p.y, p.z)
                })
                .unwrap_or(Vec3::ZERO);

            let collision = CollisionEvent {
                a,
                b,
                contact_point,
                normal_from_a_to_b: Vec3::new(normal.x, normal.y, normal.z),
                penetration_depth: (-contact.dist).max(0.0),
            };
            self.pair_cooldowns.insert(key, self.time);
            if let Some(listener) = self.collision_listener.as_mut() {
                listener(&collision);
            }
        }
        // Contact force events are unused; drain so the channel stays bounded.
        while self.contact_force_recv.try_recv().is_ok() {}
    }

    fn refresh_ground_contacts(&mut self) {
        let mut grounded = Vec::with_capacity(self.grounded_agents.len());
        for &id in &self.dynamic_ids {
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            if !record.entity_type.is_agent() {
                continue;
            }
            if self.has_static_contact(record.collider) {
                grounded.push(id);
            }
        }

        for &id in &grounded {
            if self.grounded_agents.binary_search(&id).is_err() {
                self.ground_events.push(GroundContactEvent {
                    entity: id,
                    grounded: true,
                });
            }
        }
        for &id in &self.grounded_agents {
            if grounded.binary_search(&id).is_err() && self.registry.contains_key(&id) {
                self.ground_events.push(GroundContactEvent {
                    entity: id,
                    grounded: false,
                });
            }
        }
        self.grounded_agents = grounded;
    }

    fn has_static_contact(&self, collider: ColliderHandle) -> bool {
        for pair in self.narrow_phase.contact_pairs_with(collider) {
            // Support within a small slack of the surface still counts as
            // ground; the height controller rides a few centimetres of play
            // and must not flicker the grounded state doing so.
            let supported = pair
                .find_deepest_contact()
                .map(|(_, contact)| contact.dist <= GROUND_SUPPORT_SLACK)
                .unwrap_or(false);
            if !supported {
                continue;
            }
            let other = if pair.collider1 == collider {
                pair.collider2
            } else {
                pair.collider1
            };
            let is_static = self
                .colliders
                .get(other)
                .and_then(|c| c.parent())
                .and_then(|h| self.bodies.get(h))
                .map(|rb| rb.is_fixed())
                .unwrap_or(false);
            if is_static {
                return true;
            }
        }
        false
    }

    /// Whether the agent currently touches any static body.
    pub fn has_ground_contact(&self, id: EntityId) -> bool {
        self.grounded_agents.binary_search(&id).is_ok()
    }

    /// Ground entry/exit transitions observed since the last drain.
    pub fn drain_ground_contact_events(&mut self) -> Vec<GroundContactEvent> {
        std::mem::take(&mut self.ground_events)
    }

    pub fn entities_in_radius(
        &self,
        center: Vec3,
        radius: f32,
        type_filter: Option<EntityTypes>,
    ) -> Vec<EntityId> {
        let r_sq = radius * radius;
        let mut out = Vec::new();
        self.for_each_entity(type_filter, |id, pos, _| {
            if pos.distance_squared(center) <= r_sq {
                out.push(id);
            }
        });
        out
    }

    /// The `k` nearest entities, sorted by squared distance.
    pub fn closest_entities(
        &self,
        center: Vec3,
        k: usize,
        max_radius: Option<f32>,
    ) -> Vec<(EntityId, f32)> {
        let max_sq = max_radius.map(|r| r * r).unwrap_or(f32::INFINITY);
        let mut out: Vec<(EntityId, f32)> = Vec::new();
        self.for_each_entity(None, |id, pos, _| {
            let d_sq = pos.distance_squared(center);
            if d_sq <= max_sq {
                out.push((id, d_sq));
            }
        });
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out.truncate(k);
        out
    }

    /// Short-circuiting presence check.
    pub fn has_entities_in_radius(
        &self,
        center: Vec3,
        radius: f32,
        type_filter: Option<EntityTypes>,
    ) -> bool {
        let r_sq = radius * radius;
        for &id in self.dynamic_ids.iter().chain(self.static_ids.iter()) {
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            if let Some(filter) = type_filter {
                if !filter.contains(record.entity_type.bit()) {
                    continue;
                }
            }
            if let Some(rb) = self.bodies.get(record.raw) {
                let t = rb.position().translation;
                if Vec3::new(t.x, t.y, t.z).distance_squared(center) <= r_sq {
                    return true;
                }
            }
        }
        false
    }

    fn for_each_entity(
        &self,
        type_filter: Option<EntityTypes>,
        mut f: impl FnMut(EntityId, Vec3, EntityType),
    ) {
        for &id in self.dynamic_ids.iter().chain(self.static_ids.iter()) {
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            if let Some(filter) = type_filter {
                if !filter.contains(record.entity_type.bit()) {
                    continue;
                }
            }
            if let Some(rb) = self.bodies.get(record.raw) {
                let t = rb.position().translation;
                f(id, Vec3::new(t.x, t.y, t.z), record.entity_type);
            }
        }
    }

    /// First hit along a ray, if any: `(position, normal, entity, distance)`.
    pub fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<(Vec3, Vec3, Option<EntityId>, f32)> {
        let ray = Ray::new(
            point![origin.x, origin.y, origin.z],
            vector![direction.x, direction.y, direction.z],
        );
        self.query_pipeline
            .cast_ray_and_get_normal(
                &self.bodies,
                &self.colliders,
                &ray,
                max_distance,
                true,
                QueryFilter::default(),
            )
            .map(|(collider, hit)| {
                let position = origin + direction * hit.time_of_impact;
                let normal = Vec3::new(hit.normal.x, hit.normal.y, hit.normal.z);
                let entity = self.entity_of_collider(collider);
                (position, normal, entity, hit.time_of_impact)
            })
    }

    /// All registered static bodies as world-space triangle soup, for navmesh
    /// extraction. Returns `(positions, indices)`.
    pub fn static_geometry(&self) -> (Vec<f32>, Vec<u32>) {
        let mut positions = Vec::new();
        let mut indices = Vec::new();
        for &id in &self.static_ids {
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            let Some(rb) = self.bodies.get(record.raw) else {
                continue;
            };
            let pose = from_iso(rb.position());
            append_shape_triangles(
                self.shapes.desc(record.shape),
                &pose,
                &mut positions,
                &mut indices,
            );
        }
        debug!(
            statics = self.static_ids.len(),
            triangles = indices.len() / 3,
            "extracted static geometry"
        );
        (positions, indices)
    }

    fn record(&self, id: EntityId) -> Result<&BodyRecord, PhysicsError> {
        self.registry.get(&id).ok_or(PhysicsError::EntityNotFound(id))
    }

    fn entity_of_collider(&self, collider: ColliderHandle) -> Option<EntityId> {
        self.colliders
            .get(collider)
            .map(|c| hooks::decode_entity_id(c.user_data))
            .filter(|id| self.registry.contains_key(id))
    }
}

fn validate_shape(shape: &ShapeDesc) -> Result<(), PhysicsError> {
    let ok = match shape {
        ShapeDesc::Box { half_extents } => {
            half_extents.is_finite() && half_extents.min_element() > 0.0
        }
        ShapeDesc::Capsule {
            radius,
            half_height,
        } => radius.is_finite() && *radius > 0.0 && half_height.is_finite() && *half_height >= 0.0,
        ShapeDesc::Sphere { radius } => radius.is_finite() && *radius > 0.0,
    };
    if ok {
        Ok(())
    } else {
        Err(PhysicsError::InvalidParameter(
            "shape extents must be positive and finite",
        ))
    }
}

fn insert_sorted(v: &mut Vec<EntityId>, id: EntityId) {
    if let Err(i) = v.binary_search(&id) {
        v.insert(i, id);
    }
}

fn remove_sorted(v: &mut Vec<EntityId>, id: EntityId) {
    if let Ok(i) = v.binary_search(&id) {
        v.remove(i);
    }
}

fn to_iso(pose: &RigidPose) -> Isometry<Real> {
    Isometry::from_parts(
        na::Translation3::new(pose.position.x, pose.position.y, pose.position.z),
        na::UnitQuaternion::from_quaternion(na::Quaternion::new(
            pose.rotation.w,
            pose.rotation.x,
            pose.rotation.y,
            pose.rotation.z,
        )),
    )
}

fn from_iso(iso: &Isometry<Real>) -> RigidPose {
    RigidPose {
        position: Vec3::new(iso.translation.x, iso.translation.y, iso.translation.z),
        rotation: Quat::from_xyzw(
            iso.rotation.i,
            iso.rotation.j,
            iso.rotation.k,
            iso.rotation.w,
        ),
    }
}

/// Tessellate a shape into triangles for the navmesh voxelizer. Boxes emit
/// their six faces; capsules and spheres emit a coarse box proxy around the
/// footprint (agents never walk on them, they only occlude).
fn append_shape_triangles(
    shape: &ShapeDesc,
    pose: &RigidPose,
    positions: &mut Vec<f32>,
    indices: &mut Vec<u32>,
) {
    let half = match shape {
        ShapeDesc::Box { half_extents } => *half_extents,
        ShapeDesc::Capsule {
            radius,
            half_height,
        } => Vec3::new(*radius, half_height + radius, *radius),
        ShapeDesc::Sphere { radius } => Vec3::splat(*radius),
    };

    let base = (positions.len() / 3) as u32;
    for corner in [
        Vec3::new(-1.0, -1.0, -1.0),
        Vec3::new(1.0, -1.0, -1.0),
        Vec3::new(1.0, -1.0, 1.0),
        Vec3::new(-1.0, -1.0, 1.0),
        Vec3::new(-1.0, 1.0, -1.0),
        Vec3::new(1.0, 1.0, -1.0),
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::new(-1.0, 1.0, 1.0),
    ] {
        let p = pose.position + pose.rotation * (corner * half);
        positions.extend_from_slice(&[p.x, p.y, p.z]);
    }
    // Wound so face normals point outward (+Y up for the top face).
    const FACES: [[u32; 6]; 6] = [
        [4, 7, 6, 4, 6, 5], // top
        [0, 1, 2, 0, 2, 3], // bottom
        [3, 2, 6, 3, 6, 7], // +z
        [0, 4, 5, 0, 5, 1], // -z
        [1, 5, 6, 1, 6, 2], // +x
        [0, 3, 7, 0, 7, 4], // -x
    ];
    for face in FACES {
        indices.extend(face.iter().map(|i| base + i));
    }
}
