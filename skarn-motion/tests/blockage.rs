//! Revalidation and replanning against obstacles dropped onto an active path.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use glam::Vec3;
use skarn_motion::{
    AgentConfig, MotionOrchestrator, MotorCharacterConfig, MovementEvent, MovementRequest,
    PathfindingConfig,
};
use skarn_nav::{build_navmesh, NavMeshQuery, TriangleInput};
use skarn_physics::{EntityType, Mobility, PhysicsConfig, PhysicsWorld, RigidPose, ShapeDesc};

fn flat_setup() -> (PhysicsWorld, NavMeshQuery, MotionOrchestrator) {
    let mut world = PhysicsWorld::new(PhysicsConfig::default());
    world
        .register_body(
            9000,
            EntityType::StaticObject,
            RigidPose::from_position(Vec3::new(0.0, -0.05, 0.0)),
            ShapeDesc::Box {
                half_extents: Vec3::new(15.0, 0.05, 15.0),
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
    let orchestrator = MotionOrchestrator::new(
        AgentConfig::default(),
        PathfindingConfig::default(),
        MotorCharacterConfig::default(),
    );
    (world, NavMeshQuery::new(Arc::new(mesh)), orchestrator)
}

fn spawn_agent(world: &mut PhysicsWorld, id: u32, position: Vec3) {
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

fn recorder(orchestrator: &mut MotionOrchestrator) -> Rc<RefCell<Vec<MovementEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    orchestrator.set_event_listener(move |e| sink.borrow_mut().push(e.clone()));
    events
}

fn run(
    world: &mut PhysicsWorld,
    query: &NavMeshQuery,
    orchestrator: &mut MotionOrchestrator,
    seconds: f32,
) {
    let dt = world.timestep();
    for _ in 0..(seconds / dt) as usize {
        orchestrator.update(world, query, dt);
        world.step(dt).unwrap();
    }
}

#[test]
fn temporary_obstacle_on_goal_blocks_then_replans() {
    let (mut world, query, mut orchestrator) = flat_setup();
    spawn_agent(&mut world, 1, Vec3::new(-6.0, 1.4, 0.0));
    run(&mut world, &query, &mut orchestrator, 1.0);

    let events = recorder(&mut orchestrator);
    orchestrator
        .request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 1,
                target_position: Vec3::new(6.0, 1.4, 0.0),
                max_speed: 2.0,
            },
        )
        .unwrap();

    // Drop a temporary obstacle right on the goal waypoint.
    world
        .register_body(
            500,
            EntityType::TemporaryObstacle,
            RigidPose::from_position(Vec3::new(6.0, 0.5, 0.0)),
            ShapeDesc::Box {
                half_extents: Vec3::splat(0.5),
            },
            Mobility::Static,
            None,
            false,
        )
        .unwrap();

    run(&mut world, &query, &mut orchestrator, 3.0);

    let events = events.borrow();
    let blocked = events
        .iter()
        .filter(|e| matches!(e, MovementEvent::PathBlocked { id: 1 }))
        .count();
    assert!(blocked >= 1, "obstacle on the goal never reported as blockage");

    // Local avoidance cannot clear a blocked goal, so a replan follows the
    // grace validation.
    let replanned = events
        .iter()
        .filter(|e| matches!(e, MovementEvent::PathReplanned { id: 1 }))
        .count();
    assert!(replanned >= 1, "blockage never escalated to a replan");
}

#[test]
fn progress_events_are_monotonic() {
    let (mut world, query, mut orchestrator) = flat_setup();
    spawn_agent(&mut world, 1, Vec3::new(-8.0, 1.4, -8.0));
    run(&mut world, &query, &mut orchestrator, 1.0);

    let events = recorder(&mut orchestrator);
    orchestrator
        .request_movement(
            &mut world,
            &query,
            MovementRequest {
                entity_id: 1,
                target_position: Vec3::new(8.0, 1.4, 8.0),
                max_speed: 3.0,
            },
        )
        .unwrap();
    run(&mut world, &query, &mut orchestrator, 12.0);

    let events = events.borrow();
    let fractions: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            MovementEvent::MovementProgress { id: 1, fraction } => Some(*fraction),
            _ => None,
        })
        .collect();
    for fraction in &fractions {
        assert!((0.0..=1.0).contains(fraction));
    }
    for pair in fractions.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {fractions:?}");
    }

    let reached = events
        .iter()
        .filter(|e| matches!(e, MovementEvent::DestinationReached { id: 1, .. }))
        .count();
    assert_eq!(reached, 1, "destination event must fire exactly once");
}
