//! Behavioural tests for contact shaping and event plumbing: agents block
//! without pushing, collision events respect the per-pair cooldown, and
//! ground contact transitions are reported.

use std::cell::RefCell;
use std::rc::Rc;

use glam::Vec3;
use skarn_physics::{
    EntityType, Mobility, PhysicsConfig, PhysicsWorld, RigidPose, ShapeDesc,
};

const AGENT_RADIUS: f32 = 0.5;

fn world_with_ground() -> PhysicsWorld {
    let mut world = PhysicsWorld::new(PhysicsConfig::default());
    world
        .register_body(
            9000,
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
    world
}

fn spawn_agent(world: &mut PhysicsWorld, id: u32, position: Vec3) {
    world
        .register_body(
            id,
            EntityType::Npc,
            RigidPose::from_position(position),
            ShapeDesc::Capsule {
                radius: AGENT_RADIUS,
                half_height: 0.9,
            },
            Mobility::Dynamic,
            Some(1.0),
            false,
        )
        .unwrap();
}

#[test]
fn non_pushable_agents_block_each_other() {
    let mut world = world_with_ground();
    spawn_agent(&mut world, 1, Vec3::new(-2.0, 1.4, 0.0));
    spawn_agent(&mut world, 2, Vec3::new(2.0, 1.4, 0.0));

    let dt = world.timestep();
    let mut min_distance = f32::INFINITY;
    for _ in 0..500 {
        // Drive both agents into each other every step.
        world.set_velocity(1, Vec3::new(3.0, world.get_velocity(1).unwrap().y, 0.0)).unwrap();
        world
            .set_velocity(2, Vec3::new(-3.0, world.get_velocity(2).unwrap().y, 0.0))
            .unwrap();
        world.step(dt).unwrap();

        let a = world.get_pose(1).unwrap().position;
        let b = world.get_pose(2).unwrap().position;
        min_distance = min_distance.min(a.distance(b));

        // The blocking pair must not launch anyone.
        assert!(a.y > 0.5 && a.y < 2.5, "agent 1 launched to {}", a.y);
        assert!(b.y > 0.5 && b.y < 2.5, "agent 2 launched to {}", b.y);
    }

    // Centers can approach to the sum of radii but not interpenetrate deeply.
    assert!(
        min_distance > 2.0 * AGENT_RADIUS - 0.15,
        "agents interpenetrated: {min_distance}"
    );
}

#[test]
fn pushable_agent_gets_shoved_aside() {
    let mut world = world_with_ground();
    spawn_agent(&mut world, 1, Vec3::new(-2.0, 1.4, 0.0));
    spawn_agent(&mut world, 2, Vec3::new(1.0, 1.4, 0.0));
    world.set_pushable(2, true).unwrap();

    let dt = world.timestep();
    for _ in 0..500 {
        world.set_velocity(1, Vec3::new(2.0, world.get_velocity(1).unwrap().y, 0.0)).unwrap();
        world.step(dt).unwrap();
    }

    // The pusher makes real forward progress through the pushable contact.
    let pusher = world.get_pose(1).unwrap().position;
    let pushed = world.get_pose(2).unwrap().position;
    assert!(pusher.x > 0.0, "pusher stalled at {}", pusher.x);
    assert!(pushed.x > 1.1, "pushable agent never moved: {}", pushed.x);
}

#[test]
fn collision_events_fire_with_pair_cooldown() {
    let mut world = world_with_ground();
    // Disable gravity so the only contact is the commanded ram.
    world
        .register_body(
            1,
            EntityType::Npc,
            RigidPose::from_position(Vec3::new(-3.0, 5.0, 0.0)),
            ShapeDesc::Sphere { radius: 0.5 },
            Mobility::Dynamic,
            Some(1.0),
            true,
        )
        .unwrap();
    world
        .register_body(
            2,
            EntityType::Obstacle,
            RigidPose::from_position(Vec3::new(0.0, 5.0, 0.0)),
            ShapeDesc::Sphere { radius: 0.5 },
            Mobility::Dynamic,
            Some(1.0),
            true,
        )
        .unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    world.set_collision_listener(move |event| sink.borrow_mut().push(*event));

    world.set_velocity(1, Vec3::new(4.0, 0.0, 0.0)).unwrap();
    let dt = world.timestep();
    for _ in 0..125 {
        world.step(dt).unwrap();
    }

    let events = events.borrow();
    let pair_events = events
        .iter()
        .filter(|e| (e.a == 1 && e.b == 2) || (e.a == 2 && e.b == 1))
        .count();
    assert!(pair_events >= 1, "no collision event for the ram");
    // 1 second of simulation with a 0.5s cooldown: at most a few per pair.
    assert!(pair_events <= 3, "cooldown not applied: {pair_events} events");

    let event = events
        .iter()
        .find(|e| (e.a == 1 && e.b == 2) || (e.a == 2 && e.b == 1))
        .unwrap();
    assert!(event.normal_from_a_to_b.length() > 0.9);
    assert!(event.contact_point.is_finite());
}

#[test]
fn ground_contact_transitions_are_reported() {
    let mut world = world_with_ground();
    spawn_agent(&mut world, 7, Vec3::new(0.0, 2.5, 0.0));

    let dt = world.timestep();
    let mut entered = false;
    for _ in 0..250 {
        world.step(dt).unwrap();
        for event in world.drain_ground_contact_events() {
            if event.entity == 7 && event.grounded {
                entered = true;
            }
        }
        if entered {
            break;
        }
    }
    assert!(entered, "falling agent never reported ground entry");
    assert!(world.has_ground_contact(7));

    // Launch it and expect the exit notification.
    world.apply_linear_impulse(7, Vec3::new(0.0, 8.0, 0.0)).unwrap();
    let mut exited = false;
    for _ in 0..250 {
        world.step(dt).unwrap();
        for event in world.drain_ground_contact_events() {
            if event.entity == 7 && !event.grounded {
                exited = true;
            }
        }
        if exited {
            break;
        }
    }
    assert!(exited, "launched agent never reported ground exit");
}
