//! Binding a built plan to buffers for execution.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::{
    backend::{ContextId, DevicePtr, ScratchAllocator, Stream, VariantPack},
    graph::{OperatorGraph, TensorRole, TensorUid},
    plan::ExecutionPlan,
    AlgorithmDescriptor, DType, Error, Result, ScalarValue,
};

/// Elements covered by one RNG draw of the stochastic op.
pub const RNG_PARALLEL_WIDTH: u64 = 128;

/// Philox-style `(seed, offset)` pair. The offset advances by `increment`
/// after every successful execution so masks never repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngState {
    pub seed: i64,
    pub offset: i64,
    pub increment: i64,
}

impl RngState {
    /// Increment for a stochastic op over a `[.., seq_q, seq_kv]` tensor.
    pub fn increment_for(dims: &[i64]) -> i64 {
        let elems: u64 = dims
            .iter()
            .rev()
            .take(2)
            .map(|d| (*d).max(1) as u64)
            .product();
        elems.div_ceil(RNG_PARALLEL_WIDTH) as i64
    }
}

/// One materialized tensor the caller binds a buffer to, in pack order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentBinding {
    pub role: TensorRole,
    pub uid: TensorUid,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScalarSource {
    Constant(ScalarValue),
    Caller(Option<ScalarValue>),
    Seed,
    Offset,
}

/// Zero of exactly `dtype`, or `None` when no scalar variant of that type
/// is compiled in.
fn zero_of(dtype: DType) -> Option<ScalarValue> {
    match dtype {
        DType::Pred => Some(ScalarValue::Pred(false)),
        DType::S32 => Some(ScalarValue::S32(0)),
        DType::S64 => Some(ScalarValue::S64(0)),
        DType::F32 => Some(ScalarValue::F32(0.0)),
        DType::F64 => Some(ScalarValue::F64(0.0)),
        #[cfg(feature = "half")]
        DType::F16 => Some(ScalarValue::F16(half::f16::ZERO)),
        #[cfg(feature = "bfloat")]
        DType::BF16 => Some(ScalarValue::BF16(half::bf16::ZERO)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileResult {
    pub elapsed: Duration,
    pub algorithm: AlgorithmDescriptor,
    pub workspace_size: u64,
}

/// A plan bound to the argument layout of its graph, the device context it
/// was created under, and the RNG state of its stochastic op.
///
/// Not meant for concurrent use: every execution advances the RNG offset.
/// A clone draws its own seed, so clones never share a mask sequence.
#[derive(Debug)]
pub struct Runner {
    plan: ExecutionPlan,
    arguments: Vec<ArgumentBinding>,
    scalars: Vec<(TensorUid, DType, ScalarSource)>,
    rng: Option<RngState>,
    /// `(argument index, bytes)` zeroed before every run.
    accumulators: Vec<(usize, u64)>,
    needs_side_input: bool,
    has_activation_output: bool,
    context: ContextId,
    workspace_size: Option<u64>,
}

fn fresh_seed() -> i64 {
    rand::random::<i64>() & i64::MAX
}

impl Clone for Runner {
    fn clone(&self) -> Self {
        Self {
            plan: self.plan.clone(),
            arguments: self.arguments.clone(),
            scalars: self.scalars.clone(),
            rng: self.rng.map(|rng| RngState {
                seed: fresh_seed(),
                offset: 0,
                ..rng
            }),
            accumulators: self.accumulators.clone(),
            needs_side_input: self.needs_side_input,
            has_activation_output: self.has_activation_output,
            context: self.context,
            workspace_size: self.workspace_size,
        }
    }
}

impl Runner {
    pub fn new(plan: ExecutionPlan, graph: &OperatorGraph, context: ContextId) -> Result<Self> {
        if !plan.is_for(graph) {
            crate::structural!("plan `{}` was built for a different graph", plan.tag());
        }
        let arguments: Vec<ArgumentBinding> = graph
            .materialized()
            .iter()
            .map(|t| ArgumentBinding {
                role: t.role,
                uid: t.uid,
                bytes: t.desc.size_in_bytes(),
            })
            .collect();

        let rng_inputs = graph.rng_inputs();
        let scalars = graph
            .scalar_inputs()
            .iter()
            .map(|t| {
                let source = match (t.constant, rng_inputs) {
                    (Some(v), _) => ScalarSource::Constant(v),
                    (None, Some((seed, _))) if seed == t.uid => ScalarSource::Seed,
                    (None, Some((_, offset))) if offset == t.uid => ScalarSource::Offset,
                    (None, _) => ScalarSource::Caller(None),
                };
                (t.uid, t.desc.dtype, source)
            })
            .collect();

        let rng = graph.stochastic_op().and_then(|op| {
            let dims = &graph.tensor(op.result)?.desc.dims;
            Some(RngState {
                seed: fresh_seed(),
                offset: 0,
                increment: RngState::increment_for(dims),
            })
        });

        let mut accumulators = Vec::new();
        for uid in graph.accumulators() {
            match arguments.iter().position(|a| a.uid == *uid) {
                Some(idx) => accumulators.push((idx, arguments[idx].bytes)),
                None => crate::structural!("accumulator {uid} is not a bound argument"),
            }
        }

        Ok(Self {
            needs_side_input: graph.find_role(TensorRole::SideInput).is_some(),
            has_activation_output: graph.find_role(TensorRole::Aux).is_some()
                || graph.find_role(TensorRole::SoftmaxStats).is_some_and(|t| !t.is_input()),
            plan,
            arguments,
            scalars,
            rng,
            accumulators,
            context,
            workspace_size: None,
        })
    }

    /// Fix the RNG seed instead of drawing a random one.
    pub fn with_seed(mut self, seed: i64) -> Self {
        if let Some(rng) = &mut self.rng {
            rng.seed = seed;
            rng.offset = 0;
        }
        self
    }

    /// Supply the value of a by-value scalar not fixed at build time.
    pub fn with_scalar(mut self, uid: TensorUid, value: impl Into<ScalarValue>) -> Result<Self> {
        let value = value.into();
        match self.scalars.iter_mut().find(|(u, _, _)| *u == uid) {
            Some((_, _, ScalarSource::Caller(slot))) => *slot = Some(value),
            Some(_) => crate::structural!("scalar {uid} is fixed by the graph"),
            None => crate::structural!("{uid} is not a by-value scalar of this plan"),
        }
        Ok(self)
    }

    /// Bind every caller scalar still unset to a zero of its own type. Used
    /// when profiling plans whose results are thrown away. Slots with no
    /// representable zero stay unbound.
    pub(crate) fn bind_placeholder_scalars(&mut self) {
        for (uid, dtype, source) in &mut self.scalars {
            if let ScalarSource::Caller(slot @ None) = source {
                *slot = zero_of(*dtype);
                if slot.is_none() {
                    trace!(%uid, %dtype, "no placeholder for scalar");
                }
            }
        }
    }

    /// Use a known workspace size instead of the plan's.
    pub fn with_workspace_size(mut self, bytes: u64) -> Self {
        self.workspace_size = Some(bytes);
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn arguments(&self) -> &[ArgumentBinding] {
        &self.arguments
    }

    pub fn rng_state(&self) -> Option<RngState> {
        self.rng
    }

    pub fn needs_side_input(&self) -> bool {
        self.needs_side_input
    }

    pub fn has_activation_output(&self) -> bool {
        self.has_activation_output
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn workspace_size(&self) -> u64 {
        self.workspace_size
            .unwrap_or_else(|| self.plan.workspace_size())
    }

    pub fn run(
        &mut self,
        stream: &dyn Stream,
        buffers: &[DevicePtr],
        scratch: &dyn ScratchAllocator,
    ) -> Result<()> {
        self.run_profiled(stream, buffers, scratch, false).map(|_| ())
    }

    /// Execute once. With `profile`, the stream is synchronized around the
    /// launch and the elapsed time is reported.
    #[tracing::instrument(skip_all, fields(plan = self.plan.tag()))]
    pub fn run_profiled(
        &mut self,
        stream: &dyn Stream,
        buffers: &[DevicePtr],
        scratch: &dyn ScratchAllocator,
        profile: bool,
    ) -> Result<Option<ProfileResult>> {
        if stream.context() != self.context {
            return Err(Error::ContextMismatch {
                expected: self.context.to_string(),
                actual: stream.context().to_string(),
            }
            .bt());
        }
        if buffers.len() != self.arguments.len() {
            crate::structural!(
                "expected {} buffers, got {}",
                self.arguments.len(),
                buffers.len()
            );
        }

        let mut scalars = Vec::with_capacity(self.scalars.len());
        for (uid, _, source) in &self.scalars {
            let value = match (source, self.rng) {
                (ScalarSource::Constant(v), _) | (ScalarSource::Caller(Some(v)), _) => *v,
                (ScalarSource::Seed, Some(rng)) => ScalarValue::S64(rng.seed),
                (ScalarSource::Offset, Some(rng)) => ScalarValue::S64(rng.offset),
                _ => crate::structural!("scalar {uid} has no value"),
            };
            scalars.push((*uid, value));
        }

        let workspace_size = self.workspace_size();
        let workspace = if workspace_size > 0 {
            Some(scratch.allocate(workspace_size)?)
        } else {
            None
        };

        for (idx, bytes) in &self.accumulators {
            stream.memset_zero(buffers[*idx], *bytes)?;
        }

        let pack = VariantPack {
            uids: self.arguments.iter().map(|a| a.uid).collect(),
            ptrs: buffers.to_vec(),
            workspace,
            workspace_size,
            scalars,
        };
        trace!(?pack, "binding variant pack");

        let start = profile.then(|| stream.synchronize().map(|_| Instant::now()));
        let start = start.transpose()?;
        self.plan.artifact().execute(stream, &pack)?;
        let elapsed = match start {
            Some(start) => {
                stream.synchronize()?;
                Some(start.elapsed())
            }
            None => None,
        };

        if let Some(rng) = &mut self.rng {
            rng.offset += rng.increment;
        }

        Ok(elapsed.map(|elapsed| ProfileResult {
            elapsed,
            algorithm: self.plan.descriptor().clone(),
            workspace_size,
        }))
    }
}
