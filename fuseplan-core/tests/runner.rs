use fuseplan_core::{
    graph::{ConvParams, DeclaredInputs},
    Activation, AttentionFlags, AttentionShape, Backend, ConvShape, DType, Error, ExecutionPlan,
    FusionPattern, GemmEpilogue, GemmShape, HeuristicMode, HostAllocator, HostBackend,
    OperatorGraph, PlanBuilder, RngState, Runner, ScalarValue, TensorDesc, TensorRole,
};

mod common;

fn plan_for(backend: &HostBackend, graph: &OperatorGraph) -> ExecutionPlan {
    let candidates = backend
        .query_engines(graph, HeuristicMode::Instant)
        .unwrap();
    PlanBuilder::new(backend)
        .build_first(graph, &candidates, "fp")
        .unwrap()
}

fn runner_for(backend: &HostBackend, graph: &OperatorGraph) -> Runner {
    Runner::new(plan_for(backend, graph), graph, backend.context()).unwrap()
}

fn attention(flags: AttentionFlags, backward: bool) -> OperatorGraph {
    let shape = AttentionShape {
        batch: 2,
        heads: 4,
        seq_q: 64,
        seq_kv: 64,
        head_dim: 32,
        dtype: DType::F16,
        scale: 0.125,
        dropout_rate: 0.1,
    };
    let pattern = if backward {
        FusionPattern::AttentionBackward { shape, flags }
    } else {
        FusionPattern::AttentionForward { shape, flags }
    };
    pattern.build().unwrap()
}

#[test]
fn binds_arguments_in_graph_order() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let mut runner = runner_for(&backend, &graph);

    let roles: Vec<TensorRole> = runner.arguments().iter().map(|a| a.role).collect();
    assert_eq!(
        roles,
        vec![TensorRole::Lhs, TensorRole::Rhs, TensorRole::Bias, TensorRole::Output]
    );
    let bytes: Vec<u64> = runner.arguments().iter().map(|a| a.bytes).collect();
    assert_eq!(bytes, vec![4 * 8 * 4, 8 * 16 * 4, 16 * 4, 4 * 16 * 4]);
    assert!(!runner.needs_side_input());
    assert!(!runner.has_activation_output());
    assert!(runner.rng_state().is_none());

    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);
    runner.run(&stream, &buffers, &scratch).unwrap();

    let launches = stream.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].tag, runner.plan().tag());
    assert_eq!(launches[0].pack.ptrs, buffers);
    let uids: Vec<_> = graph.materialized().iter().map(|t| t.uid).collect();
    assert_eq!(launches[0].pack.uids, uids);
    assert!(launches[0].pack.scalars.is_empty());
    assert!(launches[0].pack.workspace.is_none());
}

#[test]
fn refuses_a_stream_from_another_context() {
    let backend = HostBackend::new();
    let other = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let mut runner = runner_for(&backend, &graph);
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);

    let stream = other.create_stream();
    let err = runner.run(&stream, &buffers, &scratch).unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err.inner(), Error::ContextMismatch { .. }));
    assert!(stream.launches().is_empty());
}

#[test]
fn buffer_count_must_match() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let mut runner = runner_for(&backend, &graph);
    let scratch = HostAllocator::new();
    let mut buffers = common::bind_buffers(&runner, &scratch);
    buffers.pop();

    let err = runner
        .run(&backend.create_stream(), &buffers, &scratch)
        .unwrap_err();
    assert!(err.is_structural());
}

#[test]
fn plan_for_another_graph_is_rejected() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let other = FusionPattern::MatmulBiasActivation {
        shape: GemmShape::new(4, 8, 16, DType::F32),
        epilogue: GemmEpilogue::Relu,
    }
    .build()
    .unwrap();
    let err = Runner::new(plan_for(&backend, &graph), &other, backend.context()).unwrap_err();
    assert!(err.is_structural());
}

#[test]
fn dropout_offset_advances_per_run() {
    let backend = HostBackend::new();
    let graph = attention(
        AttentionFlags {
            use_dropout: true,
            ..Default::default()
        },
        false,
    );
    let mut runner = runner_for(&backend, &graph).with_seed(7);
    assert_eq!(
        runner.rng_state(),
        Some(RngState {
            seed: 7,
            offset: 0,
            increment: 64 * 64 / 128,
        })
    );

    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);
    runner.run(&stream, &buffers, &scratch).unwrap();
    runner.run(&stream, &buffers, &scratch).unwrap();
    assert_eq!(runner.rng_state().unwrap().offset, 64);

    let (seed, offset) = graph.rng_inputs().unwrap();
    let scale = graph.find_role(TensorRole::Scale).unwrap().uid;
    let launches = stream.launches();
    assert_eq!(
        launches[0].pack.scalars,
        vec![
            (scale, ScalarValue::F32(0.125)),
            (seed, ScalarValue::S64(7)),
            (offset, ScalarValue::S64(0)),
        ]
    );
    assert_eq!(launches[1].pack.scalars[2], (offset, ScalarValue::S64(32)));
}

#[test]
fn cloned_runners_draw_independent_masks() {
    let backend = HostBackend::new();
    let graph = attention(
        AttentionFlags {
            use_dropout: true,
            ..Default::default()
        },
        false,
    );
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let mut runner = runner_for(&backend, &graph).with_seed(7);
    let buffers = common::bind_buffers(&runner, &scratch);
    runner.run(&stream, &buffers, &scratch).unwrap();

    let mut copy = runner.clone();
    let copied = copy.rng_state().unwrap();
    assert_ne!(copied.seed, 7);
    assert!(copied.seed >= 0);
    assert_eq!(copied.offset, 0);
    assert_eq!(copied.increment, runner.rng_state().unwrap().increment);

    runner.run(&stream, &buffers, &scratch).unwrap();
    copy.run(&stream, &buffers, &scratch).unwrap();
    let (seed, offset) = graph.rng_inputs().unwrap();
    let rng_scalars = |idx: usize| -> Vec<(fuseplan_core::TensorUid, ScalarValue)> {
        stream.launches()[idx]
            .pack
            .scalars
            .iter()
            .filter(|(uid, _)| *uid == seed || *uid == offset)
            .copied()
            .collect()
    };
    assert_ne!(rng_scalars(1), rng_scalars(2));
    assert_eq!(copy.plan().descriptor(), runner.plan().descriptor());
    assert_eq!(copy.arguments(), runner.arguments());
}

#[test]
fn rng_increment_rounds_up() {
    assert_eq!(RngState::increment_for(&[2, 4, 64, 64]), 32);
    assert_eq!(RngState::increment_for(&[1, 1, 3, 5]), 1);
    assert_eq!(RngState::increment_for(&[1, 1, 129, 1]), 2);
}

#[test]
fn failed_runs_are_surfaced_verbatim() {
    let backend = HostBackend::new();
    let graph = attention(
        AttentionFlags {
            use_dropout: true,
            ..Default::default()
        },
        false,
    );
    let mut runner = runner_for(&backend, &graph).with_seed(1);
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);

    stream.fail_next("device lost");
    let err = runner.run(&stream, &buffers, &scratch).unwrap_err();
    match err.inner() {
        Error::Execution(msg) => assert_eq!(msg, "device lost"),
        other => panic!("unexpected error {other}"),
    }
    // The failed launch consumed no random numbers.
    assert_eq!(runner.rng_state().unwrap().offset, 0);

    runner.run(&stream, &buffers, &scratch).unwrap();
    assert_eq!(stream.launches().len(), 1);
}

#[test]
fn accumulator_is_zeroed_before_every_run() {
    let backend = HostBackend::new();
    let graph = attention(AttentionFlags::default(), true);
    let mut runner = runner_for(&backend, &graph);
    assert_eq!(runner.workspace_size(), 2 * 4 * 64 * 4);

    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);
    let accum = runner
        .arguments()
        .iter()
        .position(|a| a.role == TensorRole::QueryGradAccum)
        .unwrap();

    runner.run(&stream, &buffers, &scratch).unwrap();
    runner.run(&stream, &buffers, &scratch).unwrap();

    let expected = (buffers[accum], 2 * 4 * 64 * 32 * 4);
    assert_eq!(stream.zeroed(), vec![expected, expected]);
    // One workspace allocation per run on top of the argument buffers.
    assert_eq!(scratch.allocations().len(), buffers.len() + 2);
    let launch = &stream.launches()[0];
    assert_eq!(launch.pack.workspace_size, 2 * 4 * 64 * 4);
    assert!(launch.pack.workspace.is_some());
}

#[test]
fn scratch_exhaustion_is_an_execution_failure() {
    let backend = HostBackend::new();
    let graph = attention(AttentionFlags::default(), true);
    let mut runner = runner_for(&backend, &graph);
    let stream = backend.create_stream();
    let buffers = common::bind_buffers(&runner, &HostAllocator::new());

    let tiny = HostAllocator::new().with_limit(16);
    let err = runner.run(&stream, &buffers, &tiny).unwrap_err();
    assert!(matches!(err.inner(), Error::Execution(_)));
    assert!(stream.launches().is_empty());
}

#[test]
fn known_workspace_size_overrides_the_plan() {
    let backend = HostBackend::new();
    let graph = attention(AttentionFlags::default(), true);
    let mut runner = runner_for(&backend, &graph).with_workspace_size(0);
    assert_eq!(runner.workspace_size(), 0);

    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);
    let err = runner.run(&stream, &buffers, &scratch).unwrap_err();
    assert!(matches!(err.inner(), Error::Execution(_)));
}

#[test]
fn profiling_reports_the_algorithm() {
    let backend = HostBackend::new().with_simulated_latency();
    let graph = common::gemm_bias_relu().build().unwrap();
    let mut runner = runner_for(&backend, &graph);
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let buffers = common::bind_buffers(&runner, &scratch);

    let profile = runner
        .run_profiled(&stream, &buffers, &scratch, true)
        .unwrap()
        .unwrap();
    assert_eq!(&profile.algorithm, runner.plan().descriptor());
    assert_eq!(profile.workspace_size, 0);
    assert!(profile.elapsed >= std::time::Duration::from_micros(500));

    assert!(runner
        .run_profiled(&stream, &buffers, &scratch, false)
        .unwrap()
        .is_none());
}

#[test]
fn caller_scalars_must_be_bound() {
    let backend = HostBackend::new();
    let graph = OperatorGraph::from_op_sequence(
        "0:[f32]matmul();1:[f32]scale(0);",
        &DeclaredInputs {
            lhs: TensorDesc::new(DType::F32, [4, 8]),
            rhs: TensorDesc::new(DType::F32, [8, 16]),
            output_dims: vec![4, 16],
            conv: None,
        },
    )
    .unwrap();
    let scale = graph.find_role(TensorRole::Scale).unwrap().uid;
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();

    let mut unbound = runner_for(&backend, &graph);
    let buffers = common::bind_buffers(&unbound, &scratch);
    assert!(unbound
        .run(&stream, &buffers, &scratch)
        .unwrap_err()
        .is_structural());

    let mut bound = runner_for(&backend, &graph).with_scalar(scale, 2.0f32).unwrap();
    bound.run(&stream, &buffers, &scratch).unwrap();
    assert_eq!(
        stream.launches()[0].pack.scalars,
        vec![(scale, ScalarValue::F32(2.0))]
    );

    let lhs = graph.find_role(TensorRole::Lhs).unwrap().uid;
    assert!(runner_for(&backend, &graph)
        .with_scalar(lhs, 1.0f32)
        .unwrap_err()
        .is_structural());
}

#[test]
fn graph_constants_cannot_be_overridden() {
    let backend = HostBackend::new();
    let graph = attention(AttentionFlags::default(), false);
    let scale = graph.find_role(TensorRole::Scale).unwrap().uid;
    assert!(runner_for(&backend, &graph)
        .with_scalar(scale, 1.0f32)
        .unwrap_err()
        .is_structural());
}

#[test]
fn flags_follow_the_graph() {
    let backend = HostBackend::new();
    let conv = FusionPattern::ConvAddBiasActivation {
        shape: ConvShape {
            input: TensorDesc::new(DType::F32, [1, 3, 8, 8]),
            filter: TensorDesc::new(DType::F32, [4, 3, 3, 3]),
            output: TensorDesc::new(DType::F32, [1, 4, 6, 6]),
            params: ConvParams::unit(2),
        },
        use_side_input: true,
        use_bias: false,
        activation: Some(Activation::Relu),
    }
    .build()
    .unwrap();
    assert!(runner_for(&backend, &conv).needs_side_input());

    let aux = FusionPattern::MatmulBiasActivation {
        shape: GemmShape::new(4, 8, 16, DType::F32),
        epilogue: GemmEpilogue::GeluAux,
    }
    .build()
    .unwrap();
    assert!(runner_for(&backend, &aux).has_activation_output());

    let stats = attention(
        AttentionFlags {
            has_activation: true,
            ..Default::default()
        },
        false,
    );
    assert!(runner_for(&backend, &stats).has_activation_output());
    let backward = attention(AttentionFlags::default(), true);
    assert!(!runner_for(&backend, &backward).has_activation_output());
}
