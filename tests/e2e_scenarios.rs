use std::sync::Arc;

use harmonics::backend::RequestedBackend;
use harmonics::deploy::Deployment;
use harmonics::graph::ast::{arrow, build_graph, GraphAst};
use harmonics::graph::partition::partition_by_layer;
use harmonics::precision::FixedWidth;
use harmonics::registry::FunctionRegistry;
use harmonics::runtime::{CycleRuntime, FixedProducer};
use harmonics::scheduler::DistributedScheduler;
use harmonics::tensor::Tensor;
use harmonics::training::{fit, TrainingOptions};

fn runtime_for(ast: &GraphAst, deployment: Deployment) -> CycleRuntime {
    let graph = Arc::new(build_graph(ast).unwrap());
    CycleRuntime::new(graph, Box::new(FixedWidth(32)), FunctionRegistry::with_builtins(), deployment)
}

#[test]
fn identity_cycle_copies_producer_to_consumer() {
    let ast = GraphAst::new().producer("p", Some(2)).consumer("c", None).flow("p", vec![arrow("c", false, None)]);
    let mut rt = runtime_for(&ast, Deployment::new(RequestedBackend::Cpu));
    rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 2.0])])));
    rt.forward().unwrap();
    assert_eq!(rt.state().consumer_tensors[0].as_f32(), vec![1.0, 2.0]);
}

#[test]
fn activation_clamps_negatives_before_reaching_the_consumer() {
    let ast = GraphAst::new()
        .producer("p", Some(3))
        .layer("l")
        .consumer("c", None)
        .flow("p", vec![arrow("l", false, Some("relu"))])
        .flow("l", vec![arrow("c", false, None)]);
    let mut rt = runtime_for(&ast, Deployment::new(RequestedBackend::Cpu));
    rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![3], &[-1.0, 0.0, 2.5])])));
    rt.forward().unwrap();
    assert_eq!(rt.state().layer_tensors[0].as_f32(), vec![0.0, 0.0, 2.5]);
    assert_eq!(rt.state().consumer_tensors[0].as_f32(), vec![0.0, 0.0, 2.5]);
}

#[test]
fn backward_tap_writes_weights_without_disturbing_forward_state() {
    let ast = GraphAst::new()
        .producer("p", Some(2))
        .producer("t", Some(2))
        .layer("l")
        .flow("p", vec![arrow("l", false, None)])
        .flow("l", vec![arrow("t", true, Some("mse"))]);
    let mut rt = runtime_for(&ast, Deployment::new(RequestedBackend::Cpu));
    rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[0.5, 0.5])])));
    rt.bind_producer(1, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 0.0])])));
    rt.forward().unwrap();
    assert_eq!(rt.state().weights[0].as_f32(), vec![0.25, 0.25]);
    assert_eq!(rt.state().layer_tensors[0].as_f32(), vec![0.5, 0.5]);
}

#[test]
fn one_training_step_moves_params_by_learning_rate_times_gradient() {
    let ast = GraphAst::new()
        .producer("p", Some(2))
        .producer("t", Some(2))
        .layer("l")
        .flow("p", vec![arrow("l", false, None)])
        .flow("l", vec![arrow("t", true, Some("mse"))]);
    let mut rt = runtime_for(&ast, Deployment::new(RequestedBackend::Cpu));
    rt.bind_producer(0, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[0.5, 0.5])])));
    rt.bind_producer(1, Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, 0.0])])));

    let mut options = TrainingOptions { learning_rate: 0.1, accumulate_steps: 1, ..TrainingOptions::default() };
    let steps = fit(&mut rt, 1, &mut options).unwrap();
    assert_eq!(steps, 1);

    // grad = mse(0.5, 1.0) = (0.5-1.0)^2 = 0.25 for both elements; params
    // started at zero, so one SGD step leaves them at -lr*grad.
    for v in rt.state().weights[0].as_f32() {
        assert!((v - (-0.1 * 0.25)).abs() < 1e-6, "unexpected parameter value {v}");
    }
}

#[test]
fn partitioning_a_chain_and_stepping_the_scheduler_matches_the_unpartitioned_run() {
    let ast = GraphAst::new()
        .producer("p", Some(2))
        .layer("l1")
        .layer("l2")
        .layer("l3")
        .consumer("c", None)
        .flow("p", vec![arrow("l1", false, Some("relu"))])
        .flow("l1", vec![arrow("l2", false, Some("relu"))])
        .flow("l2", vec![arrow("l3", false, Some("relu"))])
        .flow("l3", vec![arrow("c", false, None)]);
    let graph = build_graph(&ast).unwrap();
    let input = Tensor::from_f32(vec![2], &[-1.0, 3.0]);

    let mut single = CycleRuntime::new(
        Arc::new(graph.clone()),
        Box::new(FixedWidth(32)),
        FunctionRegistry::with_builtins(),
        Deployment::new(RequestedBackend::Cpu),
    );
    single.bind_producer(0, Box::new(FixedProducer::new(vec![input.clone()])));
    single.forward().unwrap();
    let expected = single.state().consumer_tensors[0].clone();

    let partitions = partition_by_layer(&graph, 2).unwrap();
    let mut scheduler = DistributedScheduler::new(
        partitions,
        || Box::new(FixedWidth(32)),
        FunctionRegistry::with_builtins(),
        Deployment::new(RequestedBackend::Cpu),
    )
    .unwrap();
    scheduler.bind_producer(0, 0, Box::new(FixedProducer::new(vec![input])));
    scheduler.step().unwrap();

    let consumer_idx = scheduler.runtime(1).graph().consumers.iter().position(|c| c.name == "c").unwrap();
    let got = &scheduler.runtime(1).state().consumer_tensors[consumer_idx];
    assert_eq!(got.as_f32(), expected.as_f32());
}

#[test]
fn proof_chain_over_two_passes_verifies_against_the_first_chain_value() {
    let ast = GraphAst::new().producer("p", Some(2)).layer("l").flow("p", vec![arrow("l", false, Some("relu"))]);
    let mut rt = runtime_for(&ast, Deployment::new(RequestedBackend::Cpu).secure(true));
    rt.bind_producer(
        0,
        Box::new(FixedProducer::new(vec![Tensor::from_f32(vec![2], &[1.0, -1.0]), Tensor::from_f32(vec![2], &[2.0, 3.0])])),
    );

    rt.forward().unwrap();
    let chain_after_pass_1 = rt.chain().to_string();

    rt.forward().unwrap();
    assert!(rt.verify_chain(&chain_after_pass_1));
    assert!(!rt.verify_chain("not-the-right-chain"));
}
