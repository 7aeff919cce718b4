//! Fixed fusion templates.
//!
//! Each [`FusionPattern`] variant carries its shapes and boolean flags, and is
//! turned into a graph by the strategy registered for its [`PatternKind`].

use super::{
    ConvParams, GraphBuilder, MatMulParams, OpClass, OpKind, OperatorGraph, PointwiseMode,
    ReductionMode, ResultSlot, TensorRole, TensorUid,
};
use crate::{DType, Result, ScalarValue, TensorDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Relu,
    Gelu,
    Tanh,
    Sigmoid,
    Elu,
}

impl Activation {
    fn mode(&self) -> PointwiseMode {
        match self {
            Self::Relu => PointwiseMode::Relu,
            Self::Gelu => PointwiseMode::Gelu,
            Self::Tanh => PointwiseMode::Tanh,
            Self::Sigmoid => PointwiseMode::Sigmoid,
            Self::Elu => PointwiseMode::Elu,
        }
    }
}

/// Epilogue fused after a GEMM. `*Aux` variants also export the
/// pre-activation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmEpilogue {
    Default,
    Bias,
    Relu,
    BiasRelu,
    Gelu,
    BiasGelu,
    GeluAux,
    BiasGeluAux,
}

impl GemmEpilogue {
    pub fn has_bias(&self) -> bool {
        matches!(
            self,
            Self::Bias | Self::BiasRelu | Self::BiasGelu | Self::BiasGeluAux
        )
    }

    pub fn activation(&self) -> Option<Activation> {
        match self {
            Self::Relu | Self::BiasRelu => Some(Activation::Relu),
            Self::Gelu | Self::BiasGelu | Self::GeluAux | Self::BiasGeluAux => {
                Some(Activation::Gelu)
            }
            Self::Default | Self::Bias => None,
        }
    }

    pub fn has_aux_output(&self) -> bool {
        matches!(self, Self::GeluAux | Self::BiasGeluAux)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemmShape {
    pub batch: Option<i64>,
    pub m: i64,
    pub k: i64,
    pub n: i64,
    pub dtype: DType,
    pub output_dtype: DType,
}

impl GemmShape {
    pub fn new(m: i64, k: i64, n: i64, dtype: DType) -> Self {
        Self {
            batch: None,
            m,
            k,
            n,
            dtype,
            output_dtype: dtype,
        }
    }

    fn dims(&self, rows: i64, cols: i64) -> Vec<i64> {
        self.batch
            .into_iter()
            .chain([rows, cols])
            .collect::<Vec<_>>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvShape {
    pub input: TensorDesc,
    pub filter: TensorDesc,
    pub output: TensorDesc,
    pub params: ConvParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttentionShape {
    pub batch: i64,
    pub heads: i64,
    pub seq_q: i64,
    pub seq_kv: i64,
    pub head_dim: i64,
    pub dtype: DType,
    pub scale: f64,
    pub dropout_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttentionFlags {
    pub use_bias: bool,
    pub use_mask: bool,
    pub use_dropout: bool,
    pub is_causal: bool,
    /// Forward: export softmax statistics for a later backward pass.
    /// Backward: emit a bias gradient.
    pub has_activation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FusionPattern {
    MatmulBiasActivation {
        shape: GemmShape,
        epilogue: GemmEpilogue,
    },
    ConvAddBiasActivation {
        shape: ConvShape,
        use_side_input: bool,
        use_bias: bool,
        activation: Option<Activation>,
    },
    AttentionForward {
        shape: AttentionShape,
        flags: AttentionFlags,
    },
    AttentionBackward {
        shape: AttentionShape,
        flags: AttentionFlags,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    MatmulBiasActivation,
    ConvAddBiasActivation,
    AttentionForward,
    AttentionBackward,
}

type Strategy = fn(&FusionPattern) -> Result<OperatorGraph>;

const STRATEGIES: [(PatternKind, Strategy); 4] = [
    (PatternKind::MatmulBiasActivation, build_gemm),
    (PatternKind::ConvAddBiasActivation, build_conv),
    (PatternKind::AttentionForward, build_attention_fwd),
    (PatternKind::AttentionBackward, build_attention_bwd),
];

impl FusionPattern {
    pub fn kind(&self) -> PatternKind {
        match self {
            Self::MatmulBiasActivation { .. } => PatternKind::MatmulBiasActivation,
            Self::ConvAddBiasActivation { .. } => PatternKind::ConvAddBiasActivation,
            Self::AttentionForward { .. } => PatternKind::AttentionForward,
            Self::AttentionBackward { .. } => PatternKind::AttentionBackward,
        }
    }

    pub fn op_class(&self) -> OpClass {
        match self.kind() {
            PatternKind::MatmulBiasActivation => OpClass::Matmul,
            PatternKind::ConvAddBiasActivation => OpClass::Convolution,
            PatternKind::AttentionForward => OpClass::AttentionForward,
            PatternKind::AttentionBackward => OpClass::AttentionBackward,
        }
    }

    /// Short label embedded in graph signatures, one per flag combination.
    pub fn label(&self) -> String {
        match self {
            Self::MatmulBiasActivation { epilogue, .. } => format!("gemm_{epilogue:?}"),
            Self::ConvAddBiasActivation {
                use_side_input,
                use_bias,
                activation,
                ..
            } => format!(
                "conv{}{}{}",
                if *use_side_input { "_add" } else { "" },
                if *use_bias { "_bias" } else { "" },
                activation.map_or(String::new(), |a| format!("_{a:?}")),
            ),
            Self::AttentionForward { flags, .. } => format!("fmha_fwd{}", flag_suffix(flags)),
            Self::AttentionBackward { flags, .. } => format!("fmha_bwd{}", flag_suffix(flags)),
        }
    }

    /// Build the graph with the strategy registered for this variant.
    pub fn build(&self) -> Result<OperatorGraph> {
        let kind = self.kind();
        let Some((_, strategy)) = STRATEGIES.iter().find(|(k, _)| *k == kind) else {
            crate::structural!("no construction strategy for {kind:?}");
        };
        strategy(self)
    }
}

fn flag_suffix(flags: &AttentionFlags) -> String {
    let mut s = String::new();
    for (set, name) in [
        (flags.use_bias, "_bias"),
        (flags.use_mask, "_mask"),
        (flags.use_dropout, "_dropout"),
        (flags.is_causal, "_causal"),
        (flags.has_activation, "_act"),
    ] {
        if set {
            s.push_str(name);
        }
    }
    s
}

fn pointwise(mode: PointwiseMode) -> OpKind {
    OpKind::Pointwise(mode)
}

/// Result slot for the last op of a chain, or a virtual intermediate.
fn slot(last: bool, role: TensorRole, desc: TensorDesc) -> ResultSlot {
    if last {
        ResultSlot::Output(role, desc)
    } else {
        ResultSlot::Virtual(desc.cast(DType::F32))
    }
}

fn build_gemm(pattern: &FusionPattern) -> Result<OperatorGraph> {
    let FusionPattern::MatmulBiasActivation { shape, epilogue } = pattern else {
        crate::structural!("gemm strategy applied to {:?}", pattern.kind());
    };
    let mut b = GraphBuilder::new(OpClass::Matmul, pattern.label());
    let out = TensorDesc::new(shape.output_dtype, shape.dims(shape.m, shape.n));

    let lhs = b.input(
        TensorRole::Lhs,
        TensorDesc::new(shape.dtype, shape.dims(shape.m, shape.k)),
    )?;
    let rhs = b.input(
        TensorRole::Rhs,
        TensorDesc::new(shape.dtype, shape.dims(shape.k, shape.n)),
    )?;

    let activation = epilogue.activation();
    // The op feeding the activation is the aux output when one is requested.
    let mm_last = !epilogue.has_bias() && activation.is_none();
    let mm_slot = if epilogue.has_aux_output() && !epilogue.has_bias() {
        ResultSlot::Output(TensorRole::Aux, out.clone())
    } else {
        slot(mm_last, TensorRole::Output, out.clone())
    };
    let mut cur = b.op(
        OpKind::MatMul(MatMulParams::default()),
        None,
        &[lhs, rhs],
        DType::F32,
        mm_slot,
    )?;

    if epilogue.has_bias() {
        let bias = b.input(
            TensorRole::Bias,
            TensorDesc::new(shape.output_dtype, shape.dims(1, shape.n)),
        )?;
        let bias_slot = if epilogue.has_aux_output() {
            ResultSlot::Output(TensorRole::Aux, out.clone())
        } else {
            slot(activation.is_none(), TensorRole::Output, out.clone())
        };
        cur = b.op(
            pointwise(PointwiseMode::Add),
            Some(cur),
            &[bias],
            DType::F32,
            bias_slot,
        )?;
    }

    if let Some(act) = activation {
        b.op(
            pointwise(act.mode()),
            Some(cur),
            &[],
            DType::F32,
            ResultSlot::Output(TensorRole::Output, out),
        )?;
    }
    b.finish()
}

fn build_conv(pattern: &FusionPattern) -> Result<OperatorGraph> {
    let FusionPattern::ConvAddBiasActivation {
        shape,
        use_side_input,
        use_bias,
        activation,
    } = pattern
    else {
        crate::structural!("conv strategy applied to {:?}", pattern.kind());
    };
    let mut b = GraphBuilder::new(OpClass::Convolution, pattern.label());
    let out = shape.output.clone();

    let x = b.input(TensorRole::Input, shape.input.clone())?;
    let w = b.input(TensorRole::Filter, shape.filter.clone())?;

    let steps = [*use_side_input, *use_bias, activation.is_some()];
    let remaining = |from: usize| steps[from..].iter().any(|s| *s);

    let mut cur = b.op(
        OpKind::Convolution(shape.params.clone()),
        None,
        &[x, w],
        DType::F32,
        slot(!remaining(0), TensorRole::Output, out.clone()),
    )?;

    if *use_side_input {
        let z = b.input(TensorRole::SideInput, out.clone())?;
        cur = b.op(
            pointwise(PointwiseMode::Add),
            Some(cur),
            &[z],
            DType::F32,
            slot(!remaining(1), TensorRole::Output, out.clone()),
        )?;
    }
    if *use_bias {
        // Per output channel, broadcast over batch and spatial dims.
        let mut bias_dims = vec![1; out.rank()];
        if out.rank() > 1 {
            bias_dims[1] = out.dims[1];
        }
        let bias = b.input(TensorRole::Bias, TensorDesc::new(out.dtype, bias_dims))?;
        cur = b.op(
            pointwise(PointwiseMode::Add),
            Some(cur),
            &[bias],
            DType::F32,
            slot(!remaining(2), TensorRole::Output, out.clone()),
        )?;
    }
    if let Some(act) = activation {
        b.op(
            pointwise(act.mode()),
            Some(cur),
            &[],
            DType::F32,
            ResultSlot::Output(TensorRole::Output, out),
        )?;
    }
    b.finish()
}

struct AttentionInputs {
    bhsd_q: Vec<i64>,
    bhsd_kv: Vec<i64>,
    scores: Vec<i64>,
    stats: Vec<i64>,
}

impl AttentionShape {
    fn dims(&self) -> AttentionInputs {
        AttentionInputs {
            bhsd_q: vec![self.batch, self.heads, self.seq_q, self.head_dim],
            bhsd_kv: vec![self.batch, self.heads, self.seq_kv, self.head_dim],
            scores: vec![self.batch, self.heads, self.seq_q, self.seq_kv],
            stats: vec![self.batch, self.heads, self.seq_q, 1],
        }
    }

    /// Kᵀ as a strided view of a row-major `[b, h, s_kv, d]` buffer.
    fn key_transposed(&self) -> Result<TensorDesc> {
        let (h, s, d) = (self.heads, self.seq_kv, self.head_dim);
        TensorDesc::with_strides(
            self.dtype,
            [self.batch, h, d, s],
            [
                h.saturating_mul(s).saturating_mul(d),
                s.saturating_mul(d),
                1,
                d,
            ],
        )
    }
}

/// Shared score computation `S = mask(bias + scale * Q·Kᵀ)`. Returns the
/// root inputs and the masked scores.
fn attention_scores(
    b: &mut GraphBuilder,
    shape: &AttentionShape,
    flags: &AttentionFlags,
) -> Result<(TensorUid, TensorUid, TensorUid)> {
    let d = shape.dims();
    let scores = TensorDesc::new(DType::F32, d.scores.clone());

    let q = b.input(TensorRole::Query, TensorDesc::new(shape.dtype, d.bhsd_q))?;
    let k = b.input(TensorRole::Key, shape.key_transposed()?)?;
    let mut s = b.op(
        OpKind::MatMul(MatMulParams::default()),
        None,
        &[q, k],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;

    let scale = b.constant(TensorRole::Scale, ScalarValue::F32(shape.scale as f32))?;
    s = b.op(
        pointwise(PointwiseMode::Scale),
        Some(s),
        &[scale],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;

    if flags.use_bias {
        let bias = b.input(
            TensorRole::Bias,
            TensorDesc::new(shape.dtype, [1, shape.heads, shape.seq_q, shape.seq_kv]),
        )?;
        s = b.op(
            pointwise(PointwiseMode::Add),
            Some(s),
            &[bias],
            DType::F32,
            ResultSlot::Virtual(scores.clone()),
        )?;
    }

    if flags.use_mask || flags.is_causal {
        let fill = b.constant(TensorRole::Fill, ScalarValue::F32(f32::NEG_INFINITY))?;
        if flags.use_mask {
            let mask = b.input(
                TensorRole::Mask,
                TensorDesc::new(DType::Pred, [shape.batch, 1, shape.seq_q, shape.seq_kv]),
            )?;
            s = b.op(
                pointwise(PointwiseMode::Select),
                Some(s),
                &[mask, fill],
                DType::F32,
                ResultSlot::Virtual(scores.clone()),
            )?;
        }
        if flags.is_causal {
            let index = scores.cast(DType::S32);
            let row = b.op(
                pointwise(PointwiseMode::GenIndex { axis: 2 }),
                Some(s),
                &[],
                DType::S32,
                ResultSlot::Virtual(index.clone()),
            )?;
            let col = b.op(
                pointwise(PointwiseMode::GenIndex { axis: 3 }),
                Some(s),
                &[],
                DType::S32,
                ResultSlot::Virtual(index),
            )?;
            let keep = b.op(
                pointwise(PointwiseMode::CmpGe),
                Some(row),
                &[col],
                DType::S32,
                ResultSlot::Virtual(scores.cast(DType::Pred)),
            )?;
            s = b.op(
                pointwise(PointwiseMode::Select),
                Some(s),
                &[keep, fill],
                DType::F32,
                ResultSlot::Virtual(scores),
            )?;
        }
    }
    Ok((q, k, s))
}

fn rng_inputs(b: &mut GraphBuilder) -> Result<[TensorUid; 2]> {
    let seed = b.input(TensorRole::Seed, TensorDesc::scalar(DType::S64))?;
    let offset = b.input(TensorRole::Offset, TensorDesc::scalar(DType::S64))?;
    Ok([seed, offset])
}

fn build_attention_fwd(pattern: &FusionPattern) -> Result<OperatorGraph> {
    let FusionPattern::AttentionForward { shape, flags } = pattern else {
        crate::structural!("attention forward strategy applied to {:?}", pattern.kind());
    };
    let mut b = GraphBuilder::new(OpClass::AttentionForward, pattern.label());
    let d = shape.dims();
    let scores = TensorDesc::new(DType::F32, d.scores.clone());
    let stats = TensorDesc::new(DType::F32, d.stats.clone());

    let (_, _, s) = attention_scores(&mut b, shape, flags)?;

    // Numerically stable softmax.
    let max = b.op(
        OpKind::Reduction(ReductionMode::Max),
        Some(s),
        &[],
        DType::F32,
        ResultSlot::Virtual(stats.clone()),
    )?;
    let shifted = b.op(
        pointwise(PointwiseMode::Sub),
        Some(s),
        &[max],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let e = b.op(
        pointwise(PointwiseMode::Exp),
        Some(shifted),
        &[],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let sum = b.op(
        OpKind::Reduction(ReductionMode::Sum),
        Some(e),
        &[],
        DType::F32,
        ResultSlot::Virtual(stats.clone()),
    )?;
    let mut p = b.op(
        pointwise(PointwiseMode::Div),
        Some(e),
        &[sum],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;

    if flags.has_activation {
        let log_sum = b.op(
            pointwise(PointwiseMode::Log),
            Some(sum),
            &[],
            DType::F32,
            ResultSlot::Virtual(stats.clone()),
        )?;
        let lse = b.op(
            pointwise(PointwiseMode::Add),
            Some(log_sum),
            &[max],
            DType::F32,
            ResultSlot::Virtual(stats),
        )?;
        b.op(
            OpKind::Reshape,
            Some(lse),
            &[],
            DType::F32,
            ResultSlot::Output(
                TensorRole::SoftmaxStats,
                TensorDesc::new(DType::F32, [shape.batch, shape.heads, shape.seq_q]),
            ),
        )?;
    }

    if flags.use_dropout {
        let rng = rng_inputs(&mut b)?;
        p = b.op(
            OpKind::Dropout {
                probability: shape.dropout_rate,
            },
            Some(p),
            &rng,
            DType::F32,
            ResultSlot::Virtual(scores),
        )?;
    }

    let v = b.input(TensorRole::Value, TensorDesc::new(shape.dtype, d.bhsd_kv))?;
    b.op(
        OpKind::MatMul(MatMulParams::default()),
        Some(p),
        &[v],
        DType::F32,
        ResultSlot::Output(TensorRole::Output, TensorDesc::new(shape.dtype, d.bhsd_q)),
    )?;
    b.finish()
}

fn build_attention_bwd(pattern: &FusionPattern) -> Result<OperatorGraph> {
    let FusionPattern::AttentionBackward { shape, flags } = pattern else {
        crate::structural!("attention backward strategy applied to {:?}", pattern.kind());
    };
    let mut b = GraphBuilder::new(OpClass::AttentionBackward, pattern.label());
    let d = shape.dims();
    let scores = TensorDesc::new(DType::F32, d.scores.clone());
    let stats = TensorDesc::new(DType::F32, d.stats.clone());
    let q_desc = TensorDesc::new(shape.dtype, d.bhsd_q.clone());
    let kv_desc = TensorDesc::new(shape.dtype, d.bhsd_kv.clone());

    let (q, k_t, s) = attention_scores(&mut b, shape, flags)?;
    let v = b.input(TensorRole::Value, kv_desc.clone())?;
    let o = b.input(TensorRole::ForwardOutput, q_desc.clone())?;
    let d_o = b.input(TensorRole::OutputGrad, q_desc.clone())?;
    let lse = b.input(
        TensorRole::SoftmaxStats,
        TensorDesc::new(DType::F32, [shape.batch, shape.heads, shape.seq_q]),
    )?;

    // Recompute the probabilities from the saved log-sum-exp.
    let lse = b.op(
        OpKind::Reshape,
        Some(lse),
        &[],
        DType::F32,
        ResultSlot::Virtual(stats.clone()),
    )?;
    let shifted = b.op(
        pointwise(PointwiseMode::Sub),
        Some(s),
        &[lse],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let mut p = b.op(
        pointwise(PointwiseMode::Exp),
        Some(shifted),
        &[],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let rng = if flags.use_dropout {
        let rng = rng_inputs(&mut b)?;
        p = b.op(
            OpKind::Dropout {
                probability: shape.dropout_rate,
            },
            Some(p),
            &rng,
            DType::F32,
            ResultSlot::Virtual(scores.clone()),
        )?;
        Some(rng)
    } else {
        None
    };

    b.op(
        OpKind::MatMul(MatMulParams {
            transpose_lhs: true,
            transpose_rhs: false,
        }),
        Some(p),
        &[d_o],
        DType::F32,
        ResultSlot::Output(TensorRole::ValueGrad, kv_desc.clone()),
    )?;

    let mut dp = b.op(
        OpKind::MatMul(MatMulParams {
            transpose_lhs: false,
            transpose_rhs: true,
        }),
        Some(d_o),
        &[v],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    if let Some(rng) = rng {
        dp = b.op(
            OpKind::Dropout {
                probability: shape.dropout_rate,
            },
            Some(dp),
            &rng,
            DType::F32,
            ResultSlot::Virtual(scores.clone()),
        )?;
    }

    // Softmax backward: dS = P * (dP - rowsum(dO * O)).
    let prod = b.op(
        pointwise(PointwiseMode::Mul),
        Some(d_o),
        &[o],
        DType::F32,
        ResultSlot::Virtual(q_desc.cast(DType::F32)),
    )?;
    let row_sum = b.op(
        OpKind::Reduction(ReductionMode::Sum),
        Some(prod),
        &[],
        DType::F32,
        ResultSlot::Virtual(stats),
    )?;
    let centered = b.op(
        pointwise(PointwiseMode::Sub),
        Some(dp),
        &[row_sum],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let ds = b.op(
        pointwise(PointwiseMode::Mul),
        Some(centered),
        &[p],
        DType::F32,
        ResultSlot::Virtual(scores.clone()),
    )?;
    let scale = b.constant(TensorRole::Scale, ScalarValue::F32(shape.scale as f32))?;
    let ds = b.op(
        pointwise(PointwiseMode::Scale),
        Some(ds),
        &[scale],
        DType::F32,
        ResultSlot::Virtual(scores),
    )?;

    if flags.use_bias && flags.has_activation {
        b.op(
            OpKind::Reduction(ReductionMode::Sum),
            Some(ds),
            &[],
            DType::F32,
            ResultSlot::Output(
                TensorRole::BiasGrad,
                TensorDesc::new(shape.dtype, [1, shape.heads, shape.seq_q, shape.seq_kv]),
            ),
        )?;
    }

    // dQ = dS·K, read through the transposed key view.
    let dq_accum = b.op(
        OpKind::MatMul(MatMulParams {
            transpose_lhs: false,
            transpose_rhs: true,
        }),
        Some(ds),
        &[k_t],
        DType::F32,
        ResultSlot::Output(TensorRole::QueryGradAccum, q_desc.cast(DType::F32)),
    )?;
    b.accumulate(dq_accum)?;
    b.op(
        pointwise(PointwiseMode::Convert),
        Some(dq_accum),
        &[],
        DType::F32,
        ResultSlot::Output(TensorRole::QueryGrad, q_desc),
    )?;
    b.op(
        OpKind::MatMul(MatMulParams {
            transpose_lhs: true,
            transpose_rhs: false,
        }),
        Some(ds),
        &[q],
        DType::F32,
        ResultSlot::Output(TensorRole::KeyGrad, kv_desc),
    )?;
    b.finish()
}
