//! Reconfiguring the node invalidates every thread's context: the next call
//! on each thread performs a fresh build, re-binding uniforms with the new
//! parameter values. Old contexts (and their handles) are never reused.

use ocean_displacement_node::engine::scripted::ScriptedEngine;
use ocean_displacement_node::{DepthFalloff, OceanNode, OceanParams, ShadingPoint, Vec3};

#[test]
fn reconfigure_forces_rebuild_on_next_call() {
    let engine = ScriptedEngine::new();
    let stats = engine.stats();
    let mut node = OceanNode::new(engine, OceanParams::default());

    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 0));
    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 1));
    assert_eq!(stats.contexts_built(), 2);
    assert_eq!(stats.uniform_sets(), 12);

    node.reconfigure(OceanParams {
        time: 4.0,
        ..OceanParams::default()
    });

    // Both threads rebuild lazily on their next call.
    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 0));
    assert_eq!(stats.contexts_built(), 3);
    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 1));
    assert_eq!(stats.contexts_built(), 4);
    assert_eq!(stats.loads_succeeded(), 4);
    assert_eq!(stats.uniform_sets(), 24);
}

#[test]
fn new_uniform_values_take_effect_after_reconfigure() {
    let engine = ScriptedEngine::new();
    let mut node = OceanNode::new(
        engine,
        OceanParams {
            time: 0.0,
            ..OceanParams::default()
        },
    );

    let p = ShadingPoint::at(Vec3::new(2.0, 0.0, 1.0), 0);
    let before = node.evaluate(&p);
    // Same thread, same point: sticky uniforms keep the result stable.
    assert_eq!(node.evaluate(&p), before);

    node.reconfigure(OceanParams {
        time: 3.0,
        ..OceanParams::default()
    });
    let after = node.evaluate(&p);
    assert_ne!(
        before, after,
        "rebound time uniform must change the kernel result"
    );
}

#[test]
fn reconfigure_rebinds_falloff_parameters() {
    let engine = ScriptedEngine::new();
    let mut node = OceanNode::new(engine, OceanParams::default());

    let p = ShadingPoint::at(Vec3::new(1.0, 0.0, 2.0), 0);
    let flat = node.evaluate(&p);

    node.reconfigure(OceanParams {
        depth_falloff: DepthFalloff::Exponential,
        falloff: 0.8,
        ..OceanParams::default()
    });
    let attenuated = node.evaluate(&p);

    assert_ne!(flat, attenuated);
    // Exponential falloff shrinks the displacement magnitude.
    assert!(attenuated.g.abs() < flat.g.abs());
}

#[test]
fn each_build_materializes_a_fresh_kernel_file() {
    let engine = ScriptedEngine::new();
    let mut node = OceanNode::new(engine, OceanParams::default());

    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 0));
    let first = node.last_program_path().expect("program written");

    node.reconfigure(OceanParams::default());
    node.evaluate(&ShadingPoint::at(Vec3::ZERO, 0));
    let second = node.last_program_path().expect("program written");

    assert_ne!(first, second);
    // Old files persist on purpose (the engine may re-read them).
    assert!(first.exists());
    assert!(second.exists());

    let _ = std::fs::remove_file(first);
    let _ = std::fs::remove_file(second);
}
