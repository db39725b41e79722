//! Narrow-phase contact shaping.
//!
//! The world tags every collider's `user_data` with the owning entity's id,
//! type, mobility, pushable flag, and ground-likeness, so the rapier hook can
//! classify pairs without touching the registry. The hook applies the
//! [`materials`](crate::materials) table per solver contact: friction
//! override, zero restitution, recovery suppression for blocking pairs, and a
//! per-pair speculative-margin trim.

use rapier3d::prelude::*;

use crate::materials::{self, PairSide};
use crate::{EntityId, EntityType, Mobility};

const TYPE_SHIFT: u32 = 32;
const PUSHABLE_BIT: u128 = 1 << 36;
const GROUND_LIKE_BIT: u128 = 1 << 37;
const DYNAMIC_BIT: u128 = 1 << 38;

pub(crate) fn encode_meta(
    id: EntityId,
    entity_type: EntityType,
    mobility: Mobility,
    pushable: bool,
    ground_like: bool,
) -> u128 {
    let mut data = id as u128;
    data |= (entity_type as u128) << TYPE_SHIFT;
    if pushable {
        data |= PUSHABLE_BIT;
    }
    if ground_like {
        data |= GROUND_LIKE_BIT;
    }
    if mobility == Mobility::Dynamic {
        data |= DYNAMIC_BIT;
    }
    data
}

pub(crate) fn set_pushable_bit(data: u128, pushable: bool) -> u128 {
    if pushable {
        data | PUSHABLE_BIT
    } else {
        data & !PUSHABLE_BIT
    }
}

pub(crate) fn decode_entity_id(data: u128) -> EntityId {
    data as u32
}

fn decode_side(data: u128) -> PairSide {
    let entity_type = match (data >> TYPE_SHIFT) as u8 & 0xf {
        0 => EntityType::Player,
        1 => EntityType::Npc,
        2 => EntityType::StaticObject,
        3 => EntityType::Obstacle,
        4 => EntityType::Projectile,
        5 => EntityType::Enemy,
        _ => EntityType::TemporaryObstacle,
    };
    let mobility = if data & DYNAMIC_BIT != 0 {
        Mobility::Dynamic
    } else {
        Mobility::Static
    };
    PairSide {
        entity_type,
        mobility,
        is_pushable: data & PUSHABLE_BIT != 0,
        ground_like: data & GROUND_LIKE_BIT != 0,
    }
}

/// Stateless pair-material hook; all inputs ride in collider `user_data`.
#[derive(Default)]
pub(crate) struct MaterialHooks;

impl PhysicsHooks for MaterialHooks {
    fn modify_solver_contacts(&self, context: &mut ContactModificationContext) {
        let Some(c1) = context.colliders.get(context.collider1) else {
            return;
        };
        let Some(c2) = context.colliders.get(context.collider2) else {
            return;
        };

        let side1 = decode_side(c1.user_data);
        let side2 = decode_side(c2.user_data);
        let props = materials::properties_for_pair(side1, side2);

        // Contacts further out than the pair's speculative margin stay out of
        // the solver; rapier's own prediction distance is the upper bound.
        context
            .solver_contacts
            .retain(|contact| contact.dist <= props.speculative_margin);

        for contact in context.solver_contacts.iter_mut() {
            contact.friction = props.friction_coefficient;
            contact.restitution = 0.0;
            if props.maximum_recovery_velocity == 0.0 {
                // Blocking without pushing: hide the penetration depth from
                // the positional correction while keeping the velocity-level
                // non-penetration constraint.
                contact.dist = contact.dist.max(0.0);
            }
        }
    }
}
