use std::sync::Arc;

use fuseplan_core::{
    logging, BuildOptions, DType, FusionPattern, FusionRequest, GemmEpilogue, GemmShape,
    HostAllocator, HostBackend, Planner, ScratchAllocator,
};

fn main() {
    logging::init_tracing().unwrap();

    let backend = HostBackend::new();
    let stream = backend.create_stream();
    let scratch = HostAllocator::new();
    let planner = Planner::new(Arc::new(backend.clone()), BuildOptions::from_env().unwrap()).unwrap();

    let request = FusionRequest::Pattern(FusionPattern::MatmulBiasActivation {
        shape: GemmShape::new(128, 64, 256, DType::F32),
        epilogue: GemmEpilogue::BiasRelu,
    });
    let graph = request.to_graph().unwrap();
    println!("{}", graph.to_dot());

    let mut runner = planner.prepare(&request, &stream, &scratch).unwrap();
    for arg in runner.arguments() {
        println!("{:>8} {} ({} bytes)", arg.role.name(), arg.uid, arg.bytes);
    }
    let buffers: Vec<_> = runner
        .arguments()
        .iter()
        .map(|arg| scratch.allocate(arg.bytes).unwrap())
        .collect();

    for _ in 0..3 {
        runner.run(&stream, &buffers, &scratch).unwrap();
    }
    // Same request again: served from the plan cache.
    let again = planner.prepare(&request, &stream, &scratch).unwrap();
    assert_eq!(again.plan().tag(), runner.plan().tag());

    println!(
        "plan {} ({}), {} launches",
        runner.plan().tag(),
        runner.plan().descriptor(),
        stream.launches().len()
    );
}
