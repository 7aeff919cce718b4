#![allow(dead_code)]

use std::{
    any::Any,
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
};

use fuseplan_core::{
    Backend, CompiledPlan, ContextId, DType, DeviceDescription, DevicePtr, EngineConfig, Error,
    FusionPattern, GemmEpilogue, GemmShape, HeuristicMode, NumericNotes, OperatorGraph, Result,
    Runner, ScratchAllocator, Stream, VariantPack,
};

/// An engine the scripted backend hands out.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    pub id: i64,
    pub knobs: Vec<(i64, i64)>,
    pub notes: NumericNotes,
}

impl ScriptedEngine {
    pub fn plain(id: i64) -> Self {
        Self {
            id,
            knobs: vec![],
            notes: NumericNotes::NONE,
        }
    }

    pub fn nondeterministic(id: i64) -> Self {
        Self {
            notes: NumericNotes {
                nondeterministic: true,
                ..NumericNotes::NONE
            },
            ..Self::plain(id)
        }
    }

    pub fn with_knob(mut self, id: i64, value: i64) -> Self {
        self.knobs.push((id, value));
        self
    }
}

/// Backend with fixed candidate lists and engines that fail on demand.
#[derive(Debug)]
pub struct ScriptedBackend {
    device: DeviceDescription,
    instant: Vec<ScriptedEngine>,
    fallback: Vec<ScriptedEngine>,
    failing: HashSet<i64>,
    workspace: u64,
    compiles: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(instant: Vec<ScriptedEngine>) -> Self {
        Self {
            device: DeviceDescription {
                name: "scripted".to_string(),
                compute_capability: (9, 0),
                backend_version: 90_100,
                core_count: 1,
            },
            instant,
            fallback: vec![],
            failing: HashSet::new(),
            workspace: 0,
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: Vec<ScriptedEngine>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn failing(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.failing.extend(ids);
        self
    }

    pub fn with_workspace(mut self, bytes: u64) -> Self {
        self.workspace = bytes;
        self
    }

    /// Successful compilations so far.
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn device(&self) -> &DeviceDescription {
        &self.device
    }

    fn query_engines(&self, graph: &OperatorGraph, mode: HeuristicMode) -> Result<Vec<EngineConfig>> {
        let engines = match mode {
            HeuristicMode::Instant => &self.instant,
            HeuristicMode::Fallback => &self.fallback,
        };
        Ok(engines
            .iter()
            .map(|e| {
                EngineConfig::new(graph, e.id, e.knobs.iter().copied().collect())
                    .with_notes(e.notes)
            })
            .collect())
    }

    fn compile(&self, graph: &OperatorGraph, config: &EngineConfig) -> Result<Box<dyn CompiledPlan>> {
        if self.failing.contains(&config.engine_id) {
            return Err(Error::BuildFailure {
                engine_id: config.engine_id,
                reason: format!("engine {} is scripted to fail", config.engine_id),
            });
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPlan {
            tag: format!("scripted:eng{}:{:016x}", config.engine_id, graph.graph_id()),
            workspace: self.workspace,
        }))
    }
}

#[derive(Debug)]
struct ScriptedPlan {
    tag: String,
    workspace: u64,
}

impl CompiledPlan for ScriptedPlan {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn workspace_size(&self) -> u64 {
        self.workspace
    }

    fn execute(&self, _stream: &dyn Stream, _pack: &VariantPack) -> Result<()> {
        Ok(())
    }
}

/// A stream on an arbitrary context that accepts everything.
#[derive(Debug)]
pub struct NullStream(pub ContextId);

impl Stream for NullStream {
    fn context(&self) -> ContextId {
        self.0
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn memset_zero(&self, _ptr: DevicePtr, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `root(matmul) → bias_add → relu`, f32, (4, 8) × (8, 16).
pub fn gemm_bias_relu() -> FusionPattern {
    FusionPattern::MatmulBiasActivation {
        shape: GemmShape::new(4, 8, 16, DType::F32),
        epilogue: GemmEpilogue::BiasRelu,
    }
}

/// One scratch buffer per runner argument.
pub fn bind_buffers(runner: &Runner, scratch: &dyn ScratchAllocator) -> Vec<DevicePtr> {
    runner
        .arguments()
        .iter()
        .map(|arg| scratch.allocate(arg.bytes).unwrap())
        .collect()
}
