use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Vec3;
use skarn_physics::{EntityType, Mobility, PhysicsConfig, PhysicsWorld, RigidPose, ShapeDesc};

fn world_with_agents(count: u32) -> PhysicsWorld {
    let mut world = PhysicsWorld::new(PhysicsConfig::default());
    world
        .register_body(
            u32::MAX,
            EntityType::StaticObject,
            RigidPose::from_position(Vec3::new(0.0, -0.05, 0.0)),
            ShapeDesc::Box {
                half_extents: Vec3::new(100.0, 0.05, 100.0),
            },
            Mobility::Static,
            None,
            false,
        )
        .unwrap();

    let side = (count as f32).sqrt().ceil() as u32;
    for i in 0..count {
        let x = (i % side) as f32 * 2.0 - side as f32;
        let z = (i / side) as f32 * 2.0 - side as f32;
        world
            .register_body(
                i,
                EntityType::Npc,
                RigidPose::from_position(Vec3::new(x, 1.4, z)),
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
    world
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    for count in [16u32, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut world = world_with_agents(count);
            let dt = world.timestep();
            // Let everything settle before measuring steady state.
            for _ in 0..120 {
                world.step(dt).unwrap();
            }
            b.iter(|| {
                world.step(black_box(dt)).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_step);
criterion_main!(benches);
