//! A software device implementing the backend seam.
//!
//! Engines are a fixed catalog per operation class. Compiling checks the
//! same support constraints a real engine library would and sizes workspace
//! deterministically; executing validates the variant pack and records the
//! launch on the stream. No arithmetic is performed.

use std::{
    any::Any,
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::trace;

use super::{
    Backend, CompiledPlan, ContextId, DeviceDescription, DevicePtr, ScratchAllocator, Stream,
    VariantPack,
};
use crate::{
    engine::{knob, EngineConfig, HeuristicMode, NumericNotes},
    graph::{OpClass, OperatorGraph, TensorUid},
    DType, Error, Result,
};

/// Engine library version reported by default.
pub const HOST_BACKEND_VERSION: u32 = 90_100;

type WorkspaceRule = fn(&OperatorGraph, &BTreeMap<i64, i64>) -> u64;

#[derive(Debug, Clone)]
struct EngineSpec {
    engine_id: i64,
    mode: HeuristicMode,
    notes: NumericNotes,
    knob_sets: Vec<Vec<(i64, i64)>>,
    /// Accepted root input types; empty means any float type.
    dtypes: &'static [DType],
    min_version: u32,
    workspace: WorkspaceRule,
}

fn no_workspace(_: &OperatorGraph, _: &BTreeMap<i64, i64>) -> u64 {
    0
}

fn output_bytes(graph: &OperatorGraph) -> u64 {
    graph
        .outputs()
        .iter()
        .map(|t| t.desc.element_count().saturating_mul(4))
        .max()
        .unwrap_or(0)
}

fn split_k_workspace(graph: &OperatorGraph, knobs: &BTreeMap<i64, i64>) -> u64 {
    let split = knobs.get(&knob::SPLIT_K).copied().unwrap_or(1).max(1) as u64;
    split.saturating_mul(output_bytes(graph))
}

fn winograd_workspace(graph: &OperatorGraph, knobs: &BTreeMap<i64, i64>) -> u64 {
    let tile = knobs.get(&knob::WINOGRAD_TILE).copied().unwrap_or(2).max(1) as u64;
    ((tile + 2) * (tile + 2))
        .saturating_mul(output_bytes(graph))
        / (tile * tile)
}

fn fixed_mib(_: &OperatorGraph, _: &BTreeMap<i64, i64>) -> u64 {
    1 << 20
}

fn stats_workspace(graph: &OperatorGraph, _: &BTreeMap<i64, i64>) -> u64 {
    // Per-row softmax statistics, one f32 each.
    graph
        .root()
        .and_then(|root| graph.tensor(root.result))
        .map(|t| {
            let cols = t.desc.dims.last().copied().unwrap_or(1).max(1) as u64;
            (t.desc.element_count() / cols).saturating_mul(4)
        })
        .unwrap_or(0)
}

const TENSOR_CORE_TYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
const HALF_TYPES: &[DType] = &[DType::F16, DType::BF16];

fn notes(nondeterministic: bool, tensor_core: bool, winograd: bool) -> NumericNotes {
    NumericNotes {
        nondeterministic,
        tensor_core,
        winograd,
    }
}

fn catalog(class: OpClass) -> Vec<EngineSpec> {
    use HeuristicMode::{Fallback, Instant};
    let spec = |engine_id: i64,
                mode: HeuristicMode,
                notes: NumericNotes,
                knob_sets: Vec<Vec<(i64, i64)>>,
                dtypes: &'static [DType],
                workspace: WorkspaceRule| EngineSpec {
        engine_id,
        mode,
        notes,
        knob_sets,
        dtypes,
        min_version: 0,
        workspace,
    };
    match class {
        OpClass::Matmul => vec![
            spec(
                0,
                Instant,
                NumericNotes::NONE,
                vec![
                    vec![(knob::TILE_M, 64), (knob::TILE_N, 64)],
                    vec![(knob::TILE_M, 128), (knob::TILE_N, 128)],
                ],
                &[],
                no_workspace,
            ),
            spec(
                1,
                Instant,
                notes(false, true, false),
                vec![vec![
                    (knob::TILE_M, 128),
                    (knob::TILE_N, 256),
                    (knob::STAGES, 3),
                ]],
                TENSOR_CORE_TYPES,
                no_workspace,
            ),
            spec(
                2,
                Instant,
                notes(true, false, false),
                vec![vec![(knob::SPLIT_K, 4)]],
                &[],
                split_k_workspace,
            ),
            spec(3, Fallback, NumericNotes::NONE, vec![vec![]], &[], no_workspace),
        ],
        OpClass::Convolution => vec![
            spec(
                0,
                Instant,
                NumericNotes::NONE,
                vec![vec![(knob::TILE_M, 64)]],
                &[],
                no_workspace,
            ),
            spec(
                1,
                Instant,
                notes(false, false, true),
                vec![
                    vec![(knob::WINOGRAD_TILE, 2)],
                    vec![(knob::WINOGRAD_TILE, 4)],
                ],
                &[],
                winograd_workspace,
            ),
            spec(
                2,
                Instant,
                notes(false, true, false),
                vec![vec![(knob::USE_TENSOR_CORE, 1), (knob::SWIZZLE, 1)]],
                TENSOR_CORE_TYPES,
                no_workspace,
            ),
            spec(
                3,
                Fallback,
                notes(true, false, false),
                vec![vec![(knob::SPLIT_K, 2)]],
                &[],
                fixed_mib,
            ),
            spec(4, Fallback, NumericNotes::NONE, vec![vec![]], &[], no_workspace),
        ],
        OpClass::AttentionForward => vec![
            EngineSpec {
                min_version: 80_900,
                ..spec(
                    0,
                    Instant,
                    notes(false, true, false),
                    vec![vec![(knob::TILE_M, 128), (knob::TILE_N, 64)]],
                    HALF_TYPES,
                    stats_workspace,
                )
            },
            spec(1, Fallback, NumericNotes::NONE, vec![vec![]], &[], stats_workspace),
        ],
        OpClass::AttentionBackward => vec![
            spec(
                0,
                Instant,
                notes(true, true, false),
                vec![vec![(knob::TILE_M, 64), (knob::TILE_N, 128)]],
                HALF_TYPES,
                stats_workspace,
            ),
            spec(
                1,
                Instant,
                notes(false, true, false),
                vec![vec![(knob::TILE_M, 64), (knob::SWIZZLE, 1)]],
                HALF_TYPES,
                split_k_workspace,
            ),
            spec(2, Fallback, NumericNotes::NONE, vec![vec![]], &[], fixed_mib),
        ],
    }
}

/// Element type of the root op's first input.
fn root_input_dtype(graph: &OperatorGraph) -> Option<DType> {
    let root = graph.root()?;
    let first = root.side_inputs.first()?;
    graph.tensor(*first).map(|t| t.desc.dtype)
}

/// The reference host device.
#[derive(Debug, Clone)]
pub struct HostBackend {
    device: DeviceDescription,
    context: ContextId,
    engine_limit: Option<usize>,
    simulated_latency: bool,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            device: DeviceDescription {
                name: "host".to_string(),
                compute_capability: (0, 0),
                backend_version: HOST_BACKEND_VERSION,
                core_count: num_cpus::get(),
            },
            context: ContextId::fresh(),
            engine_limit: None,
            simulated_latency: false,
        }
    }

    /// Truncate every heuristic pass to at most `limit` candidates.
    pub fn with_engine_limit(mut self, limit: usize) -> Self {
        self.engine_limit = Some(limit);
        self
    }

    pub fn with_backend_version(mut self, version: u32) -> Self {
        self.device.backend_version = version;
        self
    }

    /// Plans sleep for an engine-dependent duration on every execution, so
    /// profiling can tell engines apart.
    pub fn with_simulated_latency(mut self) -> Self {
        self.simulated_latency = true;
        self
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// A stream on this backend's context.
    pub fn create_stream(&self) -> HostStream {
        HostStream::new(self.context)
    }

    fn find_spec(&self, class: OpClass, engine_id: i64) -> Option<EngineSpec> {
        catalog(class)
            .into_iter()
            .find(|s| s.engine_id == engine_id && s.min_version <= self.device.backend_version)
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn device(&self) -> &DeviceDescription {
        &self.device
    }

    fn query_engines(&self, graph: &OperatorGraph, mode: HeuristicMode) -> Result<Vec<EngineConfig>> {
        let mut out = Vec::new();
        for spec in catalog(graph.class()) {
            if spec.mode != mode || spec.min_version > self.device.backend_version {
                continue;
            }
            for knobs in &spec.knob_sets {
                out.push(
                    EngineConfig::new(graph, spec.engine_id, knobs.iter().copied().collect())
                        .with_notes(spec.notes),
                );
            }
        }
        if let Some(limit) = self.engine_limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn compile(
        &self,
        graph: &OperatorGraph,
        config: &EngineConfig,
    ) -> Result<Box<dyn CompiledPlan>> {
        if !config.is_for(graph) {
            crate::structural!("engine config {config} was enumerated for a different graph");
        }
        let fail = |reason: String| Error::BuildFailure {
            engine_id: config.engine_id,
            reason,
        };
        let Some(spec) = self.find_spec(graph.class(), config.engine_id) else {
            return Err(fail(format!("unknown engine for {}", graph.class())));
        };

        let dtype = root_input_dtype(graph).unwrap_or(DType::F32);
        let supported = if spec.dtypes.is_empty() {
            dtype.is_float()
        } else {
            spec.dtypes.contains(&dtype)
        };
        if !supported {
            return Err(fail(format!("{dtype} inputs not supported")));
        }
        for (id, value) in &config.knobs {
            let known = spec
                .knob_sets
                .iter()
                .any(|set| set.iter().any(|(k, _)| k == id));
            if !known || *value < 0 {
                return Err(fail(format!("invalid knob {id}={value}")));
            }
        }

        let knobs = config
            .knobs
            .iter()
            .map(|(k, v)| format!("k{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let tag = format!(
            "host:{}:eng{}[{knobs}]:{:016x}",
            graph.class(),
            config.engine_id,
            graph.graph_id()
        );
        let latency = if self.simulated_latency {
            Duration::from_micros(500 * (1 + config.engine_id.unsigned_abs()))
        } else {
            Duration::ZERO
        };
        Ok(Box::new(HostPlan {
            tag,
            workspace_size: (spec.workspace)(graph, &config.knobs),
            arguments: graph.materialized().iter().map(|t| t.uid).collect(),
            scalars: graph.scalar_inputs().iter().map(|t| t.uid).collect(),
            latency,
        }))
    }
}

#[derive(Debug, Clone)]
struct HostPlan {
    tag: String,
    workspace_size: u64,
    arguments: Vec<TensorUid>,
    scalars: Vec<TensorUid>,
    latency: Duration,
}

impl CompiledPlan for HostPlan {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn workspace_size(&self) -> u64 {
        self.workspace_size
    }

    fn execute(&self, stream: &dyn Stream, pack: &VariantPack) -> Result<()> {
        let Some(host) = stream.as_any().downcast_ref::<HostStream>() else {
            return Err(Error::execution("host plans run on host streams only"));
        };
        if pack.uids != self.arguments {
            return Err(Error::execution(format!(
                "variant pack binds {:?}, plan expects {:?}",
                pack.uids, self.arguments
            )));
        }
        if pack.ptrs.len() != pack.uids.len() || pack.ptrs.iter().any(|p| p.is_null()) {
            return Err(Error::execution("variant pack has missing or null pointers"));
        }
        let scalar_uids: Vec<TensorUid> = pack.scalars.iter().map(|(uid, _)| *uid).collect();
        if scalar_uids != self.scalars {
            return Err(Error::execution(format!(
                "variant pack scalars {scalar_uids:?}, plan expects {:?}",
                self.scalars
            )));
        }
        if self.workspace_size > 0
            && (pack.workspace.is_none() || pack.workspace_size < self.workspace_size)
        {
            return Err(Error::execution(format!(
                "plan needs {} bytes of workspace, got {}",
                self.workspace_size, pack.workspace_size
            )));
        }
        if let Some(msg) = host.fail_next.lock().take() {
            return Err(Error::execution(msg));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        trace!(tag = self.tag, "host launch");
        host.launches.lock().push(LaunchRecord {
            tag: self.tag.clone(),
            pack: pack.clone(),
        });
        Ok(())
    }
}

/// One recorded plan execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub tag: String,
    pub pack: VariantPack,
}

/// A host stream recording launches and zero fills in submission order.
#[derive(Debug)]
pub struct HostStream {
    context: ContextId,
    launches: Mutex<Vec<LaunchRecord>>,
    zeroed: Mutex<Vec<(DevicePtr, u64)>>,
    fail_next: Mutex<Option<String>>,
}

impl HostStream {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            launches: Mutex::new(Vec::new()),
            zeroed: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    pub fn zeroed(&self) -> Vec<(DevicePtr, u64)> {
        self.zeroed.lock().clone()
    }

    /// Make the next launch fail with `msg`.
    pub fn fail_next(&self, msg: impl Into<String>) {
        *self.fail_next.lock() = Some(msg.into());
    }
}

impl Stream for HostStream {
    fn context(&self) -> ContextId {
        self.context
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn memset_zero(&self, ptr: DevicePtr, bytes: u64) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::execution("memset on a null pointer"));
        }
        self.zeroed.lock().push((ptr, bytes));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

const HOST_BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const HOST_ALIGN: u64 = 256;

/// Bump allocator handing out aligned, never-null fake addresses.
#[derive(Debug)]
pub struct HostAllocator {
    next: AtomicU64,
    used: AtomicU64,
    limit: Option<u64>,
    allocations: Mutex<Vec<(DevicePtr, u64)>>,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(HOST_BASE_ADDRESS),
            used: AtomicU64::new(0),
            limit: None,
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Fail allocations once `bytes` in total have been handed out.
    pub fn with_limit(mut self, bytes: u64) -> Self {
        self.limit = Some(bytes);
        self
    }

    pub fn allocations(&self) -> Vec<(DevicePtr, u64)> {
        self.allocations.lock().clone()
    }
}

impl ScratchAllocator for HostAllocator {
    fn allocate(&self, bytes: u64) -> Result<DevicePtr> {
        let used = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(limit) = self.limit {
            if used > limit {
                self.used.fetch_sub(bytes, Ordering::SeqCst);
                return Err(Error::execution(format!(
                    "scratch allocation of {bytes} bytes exceeds the {limit} byte limit"
                )));
            }
        }
        let rounded = bytes.div_ceil(HOST_ALIGN).max(1) * HOST_ALIGN;
        let ptr = DevicePtr(self.next.fetch_add(rounded, Ordering::SeqCst));
        self.allocations.lock().push((ptr, bytes));
        Ok(ptr)
    }
}
