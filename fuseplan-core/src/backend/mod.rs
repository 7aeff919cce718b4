//! The seam between plan selection and a device.
//!
//! A [`Backend`] enumerates engines for a graph and compiles them into
//! [`CompiledPlan`]s. Plans execute on a [`Stream`] with buffers described by
//! a [`VariantPack`]; scratch memory comes from a [`ScratchAllocator`].

use std::{
    any::Any,
    fmt::{Debug, Display},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    engine::{EngineConfig, HeuristicMode},
    graph::{OperatorGraph, TensorUid},
    Result, ScalarValue,
};

pub mod host;

pub use host::{HostAllocator, HostBackend, HostStream, LaunchRecord};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Stable handle for a device context. Never reused within a process, so it
/// is safe to key caches by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn fresh() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A raw device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub name: String,
    pub compute_capability: (u32, u32),
    /// Version of the engine library; keys errata version ranges.
    pub backend_version: u32,
    pub core_count: usize,
}

/// Buffers and scalars for one plan execution. Data pointers follow `uids`
/// one to one; scalars are appended after them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariantPack {
    pub uids: Vec<TensorUid>,
    pub ptrs: Vec<DevicePtr>,
    pub workspace: Option<DevicePtr>,
    pub workspace_size: u64,
    pub scalars: Vec<(TensorUid, ScalarValue)>,
}

/// A logical execution queue bound to one device context.
pub trait Stream: Send + Sync {
    fn context(&self) -> ContextId;

    /// Block until all enqueued work completed.
    fn synchronize(&self) -> Result<()>;

    /// Enqueue a zero fill of `bytes` bytes at `ptr`.
    fn memset_zero(&self, ptr: DevicePtr, bytes: u64) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Scratch memory scoped to the allocator's lifetime.
pub trait ScratchAllocator {
    fn allocate(&self, bytes: u64) -> Result<DevicePtr>;
}

/// A compiled, directly executable plan.
pub trait CompiledPlan: Debug + Send + Sync {
    /// Display tag, identical for identical (graph, config) pairs.
    fn tag(&self) -> &str;

    fn workspace_size(&self) -> u64;

    fn execute(&self, stream: &dyn Stream, pack: &VariantPack) -> Result<()>;
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn device(&self) -> &DeviceDescription;

    /// Ranked engine candidates for `graph`. May be empty.
    fn query_engines(&self, graph: &OperatorGraph, mode: HeuristicMode) -> Result<Vec<EngineConfig>>;

    /// Compile one candidate. Must be deterministic: the same graph and
    /// config always produce an identical plan.
    fn compile(&self, graph: &OperatorGraph, config: &EngineConfig)
        -> Result<Box<dyn CompiledPlan>>;
}
