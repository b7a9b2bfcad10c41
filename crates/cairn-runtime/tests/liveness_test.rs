//! Liveness planning on chains, diamonds and random DAGs.

mod common;

use cairn_core::{Layer, Model, ModelBuilder};
use cairn_runtime::{CpuBackend, LivenessPlan, RuntimeConfig, Session};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn names(plan: &LivenessPlan, index: usize) -> Vec<&str> {
    plan.dispose_after(index).iter().map(String::as_str).collect()
}

#[test]
fn test_chain_disposes_each_value_after_its_reader() {
    let plan = LivenessPlan::build(&common::make_chain_model(4));

    assert!(plan.dispose_after(0).is_empty());
    assert_eq!(names(&plan, 1), ["A"]);
    assert_eq!(names(&plan, 2), ["B"]);
    assert_eq!(names(&plan, 3), ["C"]);
    assert!(plan.is_preserved("x"));
    assert!(plan.is_preserved("D"));
    println!("✓ Chain plan: A after B, B after C, C after D");
}

#[test]
fn test_diamond_keeps_shared_value_until_last_reader() {
    let plan = LivenessPlan::build(&common::make_diamond_model(4));

    assert_eq!(plan.last_consumer("P"), Some(2));
    assert!(plan.dispose_after(0).is_empty());
    assert!(plan.dispose_after(1).is_empty());
    assert_eq!(names(&plan, 2), ["P"]);
    assert_eq!(names(&plan, 3), ["Q", "R"]);
}

#[test]
fn test_session_exposes_plan_after_prepare() {
    common::init_tracing();
    let mut session = Session::new(
        common::make_diamond_model(4),
        CpuBackend::new(),
        RuntimeConfig::default(),
    )
    .unwrap();
    assert!(session.liveness_plan().is_none());

    session
        .execute(&[("x", common::input(&[1.0, -2.0, 3.0, -4.0]))])
        .unwrap();
    let plan = session.liveness_plan().expect("plan built by the first run");
    assert_eq!(plan.len(), 4);
    assert_eq!(names(plan, 3), ["Q", "R"]);

    // Only the model output survives the run.
    assert_eq!(session.store().bound_names(), vec!["S".to_string()]);
}

#[test]
fn test_plan_reused_for_identical_shapes() {
    let mut session = Session::new(
        common::make_chain_model(4),
        CpuBackend::new(),
        RuntimeConfig::default(),
    )
    .unwrap();
    session.execute(&[("x", common::input(&[1.0; 4]))]).unwrap();
    let generation = session.store().plan_generation();

    session.execute(&[("x", common::input(&[2.0; 4]))]).unwrap();
    assert_eq!(session.store().plan_generation(), generation);
}

fn random_dag(rng: &mut StdRng, layers: usize) -> Model {
    let mut builder = ModelBuilder::new().input("x", [4]);
    let mut produced = vec!["x".to_string()];
    for i in 0..layers {
        let arity = rng.random_range(1..=2);
        let inputs: Vec<String> = (0..arity)
            .map(|_| produced[rng.random_range(0..produced.len())].clone())
            .collect();
        let op = if arity == 1 { "Relu" } else { "Add" };
        let name = format!("n{i}");
        builder = builder.layer(Layer::new(&name, op).with_inputs(inputs.iter().map(String::as_str)));
        produced.push(name);
    }
    builder.build().unwrap()
}

#[test]
fn test_random_dags_dispose_at_last_consumer() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let layers = rng.random_range(1..12);
        let model = random_dag(&mut rng, layers);
        let plan = LivenessPlan::build(&model);

        for (index, layer) in model.layers().iter().enumerate() {
            let name = layer.name.as_str();
            let disposed_at: Vec<usize> = (0..plan.len())
                .filter(|&i| plan.dispose_after(i).iter().any(|n| n == name))
                .collect();

            if model.is_output(name) {
                assert!(disposed_at.is_empty(), "output {name} was disposed");
                continue;
            }
            let expected = model.consumers(name).into_iter().max().unwrap_or(index);
            assert_eq!(disposed_at, vec![expected], "{name}");
        }

        // Inputs are never released.
        assert!((0..plan.len()).all(|i| !plan.dispose_after(i).iter().any(|n| n == "x")));
    }
}
