use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Element-wise operation modes.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum PointwiseMode {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    /// Multiply by a by-value scalar.
    Scale,
    CmpGe,
    /// `cond ? operand : fill`, side inputs are `[cond, fill]`.
    Select,
    /// Index along `axis` of the operand's shape.
    GenIndex { axis: u32 },
    Exp,
    Log,
    Relu,
    Tanh,
    Sigmoid,
    Gelu,
    Elu,
    Neg,
    Sqrt,
    Rsqrt,
    Abs,
    /// Identity with a type conversion.
    Convert,
}

impl PointwiseMode {
    /// Number of side inputs consumed next to the chained operand.
    pub fn side_inputs(&self) -> usize {
        match self {
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Max
            | Self::Min
            | Self::Scale
            | Self::CmpGe => 1,
            Self::Select => 2,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Scale => "scale",
            Self::CmpGe => "cmp_ge",
            Self::Select => "select",
            Self::GenIndex { .. } => "gen_index",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Relu => "relu",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Gelu => "gelu",
            Self::Elu => "elu",
            Self::Neg => "neg",
            Self::Sqrt => "sqrt",
            Self::Rsqrt => "rsqrt",
            Self::Abs => "abs",
            Self::Convert => "cvt",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum ReductionMode {
    Max,
    Sum,
    /// Maximum of absolute values.
    AbsMax,
}

impl ReductionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Max => "reduce_max",
            Self::Sum => "reduce_sum",
            Self::AbsMax => "amax",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Default)]
pub struct MatMulParams {
    pub transpose_lhs: bool,
    pub transpose_rhs: bool,
}

#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub struct ConvParams {
    pub strides: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
}

impl ConvParams {
    /// Unit stride and dilation, zero padding, over `spatial_dims` dimensions.
    pub fn unit(spatial_dims: usize) -> Self {
        Self {
            strides: vec![1; spatial_dims],
            padding: vec![0; spatial_dims],
            dilation: vec![1; spatial_dims],
        }
    }
}

/// Kind of an operator node.
#[derive(PartialEq, Debug, Clone)]
pub enum OpKind {
    MatMul(MatMulParams),
    Convolution(ConvParams),
    Pointwise(PointwiseMode),
    Reduction(ReductionMode),
    Reshape,
    /// Stochastic mask with rescaling by `1 / (1 - probability)`.
    /// Side inputs are the RNG `[seed, offset]`.
    Dropout { probability: f64 },
}

impl OpKind {
    /// Root compute ops may only appear first, without an operand.
    pub fn is_root_kind(&self) -> bool {
        matches!(self, Self::MatMul(_) | Self::Convolution(_))
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self, Self::Dropout { .. })
    }

    /// Side inputs expected next to the chained operand. A root op has no
    /// operand and takes both its inputs as side inputs.
    pub fn side_inputs(&self, is_root: bool) -> usize {
        match self {
            Self::MatMul(_) | Self::Convolution(_) => {
                if is_root {
                    2
                } else {
                    1
                }
            }
            Self::Pointwise(mode) => mode.side_inputs(),
            Self::Reduction(_) | Self::Reshape => 0,
            Self::Dropout { .. } => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MatMul(_) => "matmul",
            Self::Convolution(_) => "conv",
            Self::Pointwise(mode) => mode.name(),
            Self::Reduction(mode) => mode.name(),
            Self::Reshape => "reshape",
            Self::Dropout { .. } => "dropout",
        }
    }

    /// Ops nameable in a declarative op-sequence record.
    pub fn from_record_name(name: &str) -> Option<Self> {
        use PointwiseMode as P;
        let kind = match name {
            "conv" => Self::Convolution(ConvParams::unit(2)),
            "matmul" => Self::MatMul(MatMulParams::default()),
            "add" => Self::Pointwise(P::Add),
            "sub" => Self::Pointwise(P::Sub),
            "mul" => Self::Pointwise(P::Mul),
            "div" => Self::Pointwise(P::Div),
            "max" => Self::Pointwise(P::Max),
            "min" => Self::Pointwise(P::Min),
            "scale" => Self::Pointwise(P::Scale),
            "exp" => Self::Pointwise(P::Exp),
            "log" => Self::Pointwise(P::Log),
            "relu" => Self::Pointwise(P::Relu),
            "tanh" => Self::Pointwise(P::Tanh),
            "sigmoid" => Self::Pointwise(P::Sigmoid),
            "gelu" => Self::Pointwise(P::Gelu),
            "elu" => Self::Pointwise(P::Elu),
            "neg" => Self::Pointwise(P::Neg),
            "sqrt" => Self::Pointwise(P::Sqrt),
            "rsqrt" => Self::Pointwise(P::Rsqrt),
            "abs" => Self::Pointwise(P::Abs),
            "cvt" => Self::Pointwise(P::Convert),
            "amax" => Self::Reduction(ReductionMode::AbsMax),
            "reduce_max" => Self::Reduction(ReductionMode::Max),
            "reduce_sum" => Self::Reduction(ReductionMode::Sum),
            _ => return None,
        };
        Some(kind)
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MatMul(p) => {
                f.write_str("matmul")?;
                if p.transpose_lhs {
                    f.write_str(".tl")?;
                }
                if p.transpose_rhs {
                    f.write_str(".tr")?;
                }
                Ok(())
            }
            Self::Convolution(p) => write!(
                f,
                "conv{{s={:?},p={:?},d={:?}}}",
                p.strides, p.padding, p.dilation
            ),
            Self::Pointwise(PointwiseMode::GenIndex { axis }) => write!(f, "gen_index{{{axis}}}"),
            Self::Dropout { probability } => write!(f, "dropout{{{probability:?}}}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Operation class used to key exclusion tables and engine catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    Convolution,
    Matmul,
    AttentionForward,
    AttentionBackward,
}

impl OpClass {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Convolution => "convolution",
            Self::Matmul => "matmul",
            Self::AttentionForward => "attention_forward",
            Self::AttentionBackward => "attention_backward",
        }
    }
}

impl Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
