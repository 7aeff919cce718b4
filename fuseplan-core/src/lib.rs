//! Fuseplan turns small fused numeric pipelines into cached, directly executable device plans.
//!
//! A pipeline is described either as a fixed [`FusionPattern`] (GEMM with a fused epilogue,
//! convolution with side input/bias/activation, attention forward or backward) or as a
//! declarative op sequence. Either way it becomes an [`OperatorGraph`]: an acyclic graph of
//! operator nodes over tensors that are either *materialized* (bound to a caller buffer at run
//! time) or *virtual* (intermediates that only exist inside the fused kernel).
//!
//! From there, plan selection runs the following pipeline:
//! - A [`CandidateEnumerator`] asks the [`Backend`] for ranked engine configs, widening to the
//!   fallback heuristic when the instant pass comes back empty.
//! - An [`ExclusionFilter`] drops engines listed in the errata table or disallowed by policy
//!   (winograd, nondeterministic, tensor core) before anything is compiled.
//! - A [`PlanBuilder`] compiles candidates in ranked order. It stops at the first success, or
//!   builds every candidate so the [`Autotuner`] can profile them.
//! - A [`PlanCache`] memoizes the result under a fingerprint of the graph and its arguments.
//!
//! A [`Runner`] binds the chosen plan to buffers, workspace, by-value scalars and RNG state.
//!
//! ## Quick start
//! ```
//! use std::sync::Arc;
//! use fuseplan_core::{
//!     BuildOptions, DType, FusionPattern, FusionRequest, GemmEpilogue, GemmShape, HostAllocator,
//!     HostBackend, Planner,
//! };
//!
//! let backend = HostBackend::new();
//! let stream = backend.create_stream();
//! let scratch = HostAllocator::new();
//! let planner = Planner::new(Arc::new(backend), BuildOptions::default()).unwrap();
//!
//! let request = FusionRequest::Pattern(FusionPattern::MatmulBiasActivation {
//!     shape: GemmShape::new(128, 64, 256, DType::F32),
//!     epilogue: GemmEpilogue::BiasRelu,
//! });
//! let mut runner = planner.prepare(&request, &stream, &scratch).unwrap();
//!
//! let buffers: Vec<_> = runner
//!     .arguments()
//!     .iter()
//!     .map(|arg| fuseplan_core::ScratchAllocator::allocate(&scratch, arg.bytes).unwrap())
//!     .collect();
//! runner.run(&stream, &buffers, &scratch).unwrap();
//! assert_eq!(stream.launches().len(), 1);
//! ```

pub mod algorithm;
pub mod autotune;
pub mod backend;
pub mod cache;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda_backend;
mod dtype;
pub mod engine;
pub mod errata;
mod error;
pub mod fingerprint;
pub mod graph;
pub mod heuristics;
pub mod logging;
pub mod plan;
pub mod planner;
pub mod runner;
mod shape;

pub use algorithm::{AlgorithmDescriptor, AlgorithmStore};
pub use autotune::{AutotuneResult, Autotuner};
pub use backend::{
    Backend, CompiledPlan, ContextId, DeviceDescription, DevicePtr, HostAllocator, HostBackend,
    HostStream, ScratchAllocator, Stream, VariantPack,
};
pub use cache::{CacheEntry, PlanCache};
pub use config::BuildOptions;
#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaDevice, CudaScratch, CudaStreamHandle};
pub use dtype::{DType, ScalarValue};
pub use engine::{EngineConfig, HeuristicMode, NumericNotes};
pub use errata::{ErrataTable, ExclusionFilter};
pub use error::{Context, Error, Result};
pub use fingerprint::{BufferSlice, KernelArgument};
pub use graph::{
    Activation, AttentionFlags, AttentionShape, ConvShape, FusionPattern, GemmEpilogue,
    GemmShape, GraphBuilder, OpClass, OperatorGraph, TensorRole, TensorUid,
};
pub use heuristics::{CandidateEnumerator, Candidates};
pub use plan::{ExecutionPlan, PlanBuilder};
pub use planner::{FusionRequest, Planner};
pub use runner::{ArgumentBinding, ProfileResult, RngState, Runner};
pub use shape::{contiguous_strides, TensorDesc, Vectorization};
