//! Contact material policy.
//!
//! Every narrow-phase pair is classified from the two sides' entity types and
//! pushable flags, then mapped to solver material properties through a closed
//! table. Agents block each other rigidly unless one side is pushable; ground
//! contacts get a stiff spring and a wide speculative margin so settled agents
//! neither sink nor jitter.

use crate::{EntityType, Mobility, ShapeDesc};

/// Solver-facing material for one contact pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairMaterialProperties {
    pub friction_coefficient: f32,
    /// Cap on the penetration-recovery velocity. `0.0` disables recovery
    /// impulses entirely (blocking without pushing), `f32::INFINITY` leaves
    /// the solver unrestricted.
    pub maximum_recovery_velocity: f32,
    pub spring_frequency_hz: f32,
    pub spring_damping_ratio: f32,
    /// Distance at which speculative contacts are admitted to the solver.
    pub speculative_margin: f32,
}

/// Classification outcome for a contact pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairClass {
    /// Two agents, neither pushable: rigid mutual blocking.
    AgentAgentBlocking,
    /// Two agents, at least one pushable: soft shoving contact.
    AgentAgentPushable,
    /// Agent standing on (or approaching) flat static geometry.
    AgentGround,
    Other,
}

/// One side of a contact pair, as seen by the classifier.
#[derive(Clone, Copy, Debug)]
pub struct PairSide {
    pub entity_type: EntityType,
    pub mobility: Mobility,
    pub is_pushable: bool,
    /// Whether the shape registered for this body is ground-like
    /// (see [`is_ground_like_shape`]). Only meaningful for statics.
    pub ground_like: bool,
}

impl PairSide {
    fn is_agent(&self) -> bool {
        matches!(
            self.entity_type,
            EntityType::Player | EntityType::Npc | EntityType::Enemy
        )
    }

    fn is_ground(&self) -> bool {
        self.mobility == Mobility::Static && self.ground_like
    }
}

/// A static box whose height is strictly smaller than both horizontal extents
/// reads as floor geometry; everything else (walls, props, non-box shapes)
/// falls into the generic bucket.
pub fn is_ground_like_shape(shape: &ShapeDesc) -> bool {
    match shape {
        ShapeDesc::Box { half_extents } => {
            half_extents.y < half_extents.x && half_extents.y < half_extents.z
        }
        ShapeDesc::Capsule { .. } | ShapeDesc::Sphere { .. } => false,
    }
}

pub fn classify(a: PairSide, b: PairSide) -> PairClass {
    if a.is_agent() && b.is_agent() {
        if a.is_pushable || b.is_pushable {
            PairClass::AgentAgentPushable
        } else {
            PairClass::AgentAgentBlocking
        }
    } else if (a.is_agent() && b.is_ground()) || (b.is_agent() && a.is_ground()) {
        PairClass::AgentGround
    } else {
        PairClass::Other
    }
}

/// The closed material table.
pub fn properties_for(class: PairClass) -> PairMaterialProperties {
    match class {
        // Wall-like blocking: extremely stiff, critically damped, and no
        // recovery impulse, so overlapping agents are held apart without
        // being launched.
        PairClass::AgentAgentBlocking => PairMaterialProperties {
            friction_coefficient: 0.0,
            maximum_recovery_velocity: 0.0,
            spring_frequency_hz: 240.0,
            spring_damping_ratio: 1.0,
            speculative_margin: 0.05,
        },
        PairClass::AgentAgentPushable => PairMaterialProperties {
            friction_coefficient: 0.1,
            maximum_recovery_velocity: f32::INFINITY,
            spring_frequency_hz: 30.0,
            spring_damping_ratio: 1.0,
            speculative_margin: 0.15,
        },
        // The wide margin keeps fast or jostled agents from sinking through
        // the floor between steps.
        PairClass::AgentGround => PairMaterialProperties {
            friction_coefficient: 0.10,
            maximum_recovery_velocity: f32::INFINITY,
            spring_frequency_hz: 180.0,
            spring_damping_ratio: 1.0,
            speculative_margin: 0.30,
        },
        PairClass::Other => PairMaterialProperties {
            friction_coefficient: 0.10,
            maximum_recovery_velocity: f32::INFINITY,
            spring_frequency_hz: 30.0,
            spring_damping_ratio: 1.0,
            speculative_margin: 0.15,
        },
    }
}

pub fn properties_for_pair(a: PairSide, b: PairSide) -> PairMaterialProperties {
    properties_for(classify(a, b))
}
