//! Autotune an attention forward pass once, persist the winner, then replay
//! it from the store without running heuristics.

use std::sync::Arc;

use fuseplan_core::{
    fingerprint::default_arguments, logging, AlgorithmStore, AttentionFlags, AttentionShape,
    BuildOptions, DType, FusionPattern, FusionRequest, HostAllocator, HostBackend, Planner,
    ScratchAllocator,
};

fn main() {
    logging::init_tracing().unwrap();

    let dir = std::env::temp_dir().join("fuseplan-attention-replay");
    let store = AlgorithmStore::new(dir.join("algorithms.json"));

    let backend = HostBackend::new().with_simulated_latency();
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();

    let mut options = BuildOptions {
        autotune: true,
        exhaustive_search: true,
        ..Default::default()
    };
    options.precision.allow_reduced_precision_reduction = true;
    let planner = Planner::new(Arc::new(backend.clone()), options)
        .unwrap()
        .with_store(store.clone());

    let request = FusionRequest::Pattern(FusionPattern::AttentionForward {
        shape: AttentionShape {
            batch: 2,
            heads: 8,
            seq_q: 128,
            seq_kv: 128,
            head_dim: 64,
            dtype: DType::F16,
            scale: 0.125,
            dropout_rate: 0.1,
        },
        flags: AttentionFlags {
            use_dropout: true,
            is_causal: true,
            has_activation: true,
            ..Default::default()
        },
    });

    let tuned = planner.prepare(&request, &stream, &scratch).unwrap();
    println!("autotuned: {}", tuned.plan().descriptor());

    let graph = request.to_graph().unwrap();
    let fingerprint = planner.fingerprint(&graph, &default_arguments(&graph));
    let descriptor = store.lookup(&fingerprint).unwrap();
    println!("stored under {fingerprint}: {descriptor}");

    let mut runner = planner
        .replay(&request, &descriptor, backend.context())
        .unwrap()
        .with_seed(42);
    let buffers: Vec<_> = runner
        .arguments()
        .iter()
        .map(|arg| scratch.allocate(arg.bytes).unwrap())
        .collect();
    for _ in 0..4 {
        runner.run(&stream, &buffers, &scratch).unwrap();
    }
    println!("rng after 4 runs: {:?}", runner.rng_state());
}
