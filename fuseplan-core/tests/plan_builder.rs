use fuseplan_core::{
    AlgorithmDescriptor, Backend, EngineConfig, Error, HeuristicMode, HostBackend, PlanBuilder,
};

mod common;

use common::{ScriptedBackend, ScriptedEngine};

fn five_engines() -> Vec<ScriptedEngine> {
    (0..5).map(ScriptedEngine::plain).collect()
}

#[test]
fn first_success_after_failures() {
    let backend = ScriptedBackend::new(five_engines()).failing([0, 1]);
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();
    assert_eq!(candidates.len(), 5);

    let plan = PlanBuilder::new(&backend)
        .build_first(&graph, &candidates, "fp")
        .unwrap();
    assert_eq!(plan.descriptor().engine_id, 2);
    assert!(plan.is_for(&graph));
    assert_eq!(backend.compiles(), 1);
}

#[test]
fn all_failures_report_the_last_one() {
    let backend = ScriptedBackend::new(five_engines()).failing(0..5);
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();

    let err = PlanBuilder::new(&backend)
        .build_first(&graph, &candidates, "fp")
        .unwrap_err();
    assert!(err.is_retryable());
    match err.inner() {
        Error::NoViablePlan {
            fingerprint,
            candidates,
            last_failure,
        } => {
            assert_eq!(fingerprint, "fp");
            assert_eq!(*candidates, 5);
            assert!(last_failure.as_deref().unwrap().contains("engine 4"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn empty_candidate_list_has_no_viable_plan() {
    let backend = ScriptedBackend::new(vec![]);
    let graph = common::gemm_bias_relu().build().unwrap();
    let err = PlanBuilder::new(&backend)
        .build_first(&graph, &[], "fp")
        .unwrap_err();
    assert!(matches!(
        err.inner(),
        Error::NoViablePlan {
            candidates: 0,
            last_failure: None,
            ..
        }
    ));
}

#[test]
fn duplicates_are_built_once() {
    let backend = ScriptedBackend::new(vec![
        ScriptedEngine::plain(0).with_knob(0, 64),
        ScriptedEngine::plain(1),
        ScriptedEngine::plain(0).with_knob(0, 64),
        ScriptedEngine::plain(0).with_knob(0, 128),
    ]);
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();

    let plans = PlanBuilder::new(&backend)
        .build(&graph, &candidates, "fp", false)
        .unwrap();
    let engines: Vec<String> = plans.iter().map(|p| p.descriptor().to_string()).collect();
    assert_eq!(engines, vec!["eng0{k0=64} ws=0", "eng1{} ws=0", "eng0{k0=128} ws=0"]);
    assert_eq!(backend.compiles(), 3);

    let parallel = PlanBuilder::new(&backend)
        .build_all(&graph, &candidates, "fp")
        .unwrap();
    let parallel: Vec<String> = parallel.iter().map(|p| p.descriptor().to_string()).collect();
    assert_eq!(parallel, engines);
}

#[test]
fn stop_at_first_returns_one_plan() {
    let backend = ScriptedBackend::new(five_engines());
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();
    let plans = PlanBuilder::new(&backend)
        .build(&graph, &candidates, "fp", true)
        .unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(backend.compiles(), 1);
}

#[test]
fn workspace_limit_skips_large_plans() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    // Split-k first so the limit has something to reject.
    let candidates = vec![
        EngineConfig::new(&graph, 2, [(2, 4)].into_iter().collect()),
        EngineConfig::new(&graph, 3, Default::default()),
    ];

    let unlimited = PlanBuilder::new(&backend)
        .build_first(&graph, &candidates, "fp")
        .unwrap();
    assert_eq!(unlimited.descriptor().engine_id, 2);
    assert_eq!(unlimited.workspace_size(), 4 * 4 * 16 * 4);

    let limited = PlanBuilder::new(&backend)
        .with_workspace_limit(Some(64))
        .build_first(&graph, &candidates, "fp")
        .unwrap();
    assert_eq!(limited.descriptor().engine_id, 3);
    assert_eq!(limited.workspace_size(), 0);
}

#[test]
fn configs_for_another_graph_abort_the_build() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let other = fuseplan_core::FusionPattern::MatmulBiasActivation {
        shape: fuseplan_core::GemmShape::new(8, 8, 8, fuseplan_core::DType::F32),
        epilogue: fuseplan_core::GemmEpilogue::Relu,
    }
    .build()
    .unwrap();
    let candidates = vec![
        EngineConfig::new(&other, 0, Default::default()),
        EngineConfig::new(&graph, 3, Default::default()),
    ];
    let err = PlanBuilder::new(&backend)
        .build_first(&graph, &candidates, "fp")
        .unwrap_err();
    assert!(err.is_structural());
}

#[test]
fn foreign_configs_never_reach_the_backend() {
    let backend = ScriptedBackend::new(five_engines());
    let graph = common::gemm_bias_relu().build().unwrap();
    let other = fuseplan_core::FusionPattern::MatmulBiasActivation {
        shape: fuseplan_core::GemmShape::new(8, 8, 8, fuseplan_core::DType::F32),
        epilogue: fuseplan_core::GemmEpilogue::Relu,
    }
    .build()
    .unwrap();
    let candidates = backend.query_engines(&other, HeuristicMode::Instant).unwrap();

    let err = PlanBuilder::new(&backend)
        .build_first(&graph, &candidates, "fp")
        .unwrap_err();
    assert!(err.is_structural());
    assert_eq!(backend.compiles(), 0);

    let err = PlanBuilder::new(&backend)
        .build_all(&graph, &candidates, "fp")
        .unwrap_err();
    assert!(err.is_structural());
    assert_eq!(backend.compiles(), 0);
}

#[test]
fn over_limit_workspace_is_reported_as_the_last_failure() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::plain(0)]).with_workspace(4096);
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();

    let err = PlanBuilder::new(&backend)
        .with_workspace_limit(Some(1024))
        .build_first(&graph, &candidates, "fp")
        .unwrap_err();
    assert!(err.is_retryable());
    match err.inner() {
        Error::NoViablePlan { last_failure, .. } => {
            let msg = last_failure.as_deref().unwrap();
            assert!(msg.contains("4096 bytes exceeds the 1024 byte limit"), "{msg}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn descriptor_round_trip_rebuilds_the_same_plan() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();
    let builder = PlanBuilder::new(&backend);
    let plan = builder.build_first(&graph, &candidates, "fp").unwrap();

    let json = serde_json::to_string(plan.descriptor()).unwrap();
    let stored: AlgorithmDescriptor = serde_json::from_str(&json).unwrap();
    let replayed = builder.rebuild(&graph, &stored).unwrap();

    assert_eq!(replayed.descriptor(), plan.descriptor());
    assert_eq!(replayed.tag(), plan.tag());
    assert_eq!(replayed.workspace_size(), plan.workspace_size());
}

#[test]
fn replay_rejects_a_stale_workspace_size() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let stale = AlgorithmDescriptor::new(2, [(2, 4)]).with_workspace(1);
    let err = PlanBuilder::new(&backend).rebuild(&graph, &stale).unwrap_err();
    assert!(matches!(err.inner(), Error::BuildFailure { engine_id: 2, .. }));

    // Without a recorded size any workspace is accepted.
    let loose = AlgorithmDescriptor::new(2, [(2, 4)]);
    let plan = PlanBuilder::new(&backend).rebuild(&graph, &loose).unwrap();
    assert_eq!(plan.descriptor().workspace_size, Some(1024));
}

#[test]
fn replay_of_an_unknown_engine_fails_to_build() {
    let backend = HostBackend::new();
    let graph = common::gemm_bias_relu().build().unwrap();
    let err = PlanBuilder::new(&backend)
        .rebuild(&graph, &AlgorithmDescriptor::new(99, Vec::new()))
        .unwrap_err();
    assert!(matches!(err.inner(), Error::BuildFailure { engine_id: 99, .. }));
    assert!(!err.is_structural());
}
