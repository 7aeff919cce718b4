//! Typed tensor nodes and ordered operator nodes forming a fused program.
//!
//! An [`OperatorGraph`] is only ever produced by a [`GraphBuilder`] (directly,
//! through a [`FusionPattern`] template, or by parsing a declarative op
//! sequence), so every graph handed to the rest of the crate already
//! satisfies the structural invariants checked by [`OperatorGraph::validate`].

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    fmt::{Display, Write},
    hash::{Hash, Hasher},
};

use petgraph::{
    algo::is_cyclic_directed,
    dot::{Config, Dot},
    graph::NodeIndex,
    Graph as PetGraph,
};

use crate::{DType, Result, ScalarValue, TensorDesc};

mod builder;
mod op;
mod pattern;

pub use builder::{parse_op_sequence, DeclaredInputs, GraphBuilder, OpRecord, ResultSlot};
pub use op::{ConvParams, MatMulParams, OpClass, OpKind, PointwiseMode, ReductionMode};
pub use pattern::{
    Activation, AttentionFlags, AttentionShape, ConvShape, FusionPattern, GemmEpilogue, GemmShape,
    PatternKind,
};

/// Width of each uid namespace.
pub const NAMESPACE_SPAN: i64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorUid(pub i64);

impl TensorUid {
    pub fn namespace(&self) -> Option<UidNamespace> {
        UidNamespace::of(*self)
    }
}

impl Display for TensorUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl From<TensorUid> for i64 {
    fn from(value: TensorUid) -> Self {
        value.0
    }
}

/// Disjoint id ranges. Output ids start at zero so declarative records can
/// name their results with small integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UidNamespace {
    Output,
    Operand,
    Virtual,
}

impl UidNamespace {
    pub const fn base(&self) -> i64 {
        match self {
            Self::Output => 0,
            Self::Operand => NAMESPACE_SPAN,
            Self::Virtual => 2 * NAMESPACE_SPAN,
        }
    }

    pub fn contains(&self, uid: TensorUid) -> bool {
        (self.base()..self.base() + NAMESPACE_SPAN).contains(&uid.0)
    }

    pub fn of(uid: TensorUid) -> Option<Self> {
        [Self::Output, Self::Operand, Self::Virtual]
            .into_iter()
            .find(|ns| ns.contains(uid))
    }
}

/// Logical role of a tensor as seen by the caller binding buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    Lhs,
    Rhs,
    Input,
    Filter,
    Bias,
    SideInput,
    Output,
    /// Pre-activation value exported next to the output.
    Aux,
    Query,
    Key,
    Value,
    Mask,
    Scale,
    Fill,
    Seed,
    Offset,
    SoftmaxStats,
    ForwardOutput,
    OutputGrad,
    QueryGrad,
    KeyGrad,
    ValueGrad,
    BiasGrad,
    QueryGradAccum,
    Intermediate,
}

impl TensorRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lhs => "lhs",
            Self::Rhs => "rhs",
            Self::Input => "input",
            Self::Filter => "filter",
            Self::Bias => "bias",
            Self::SideInput => "side_input",
            Self::Output => "output",
            Self::Aux => "aux",
            Self::Query => "q",
            Self::Key => "k",
            Self::Value => "v",
            Self::Mask => "mask",
            Self::Scale => "scale",
            Self::Fill => "fill",
            Self::Seed => "seed",
            Self::Offset => "offset",
            Self::SoftmaxStats => "softmax_stats",
            Self::ForwardOutput => "fwd_output",
            Self::OutputGrad => "d_output",
            Self::QueryGrad => "d_q",
            Self::KeyGrad => "d_k",
            Self::ValueGrad => "d_v",
            Self::BiasGrad => "d_bias",
            Self::QueryGradAccum => "d_q_accum",
            Self::Intermediate => "tmp",
        }
    }
}

impl Display for TensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorNode {
    pub uid: TensorUid,
    pub desc: TensorDesc,
    pub role: TensorRole,
    /// Value known at graph construction; inlined into the signature.
    pub constant: Option<ScalarValue>,
    pub(crate) is_virtual: bool,
    /// Never virtualized, even when consumed by a later op.
    pub(crate) pinned: bool,
    /// Sequence index of the producing op; `None` for graph inputs.
    pub(crate) producer: Option<usize>,
}

impl TensorNode {
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Backed by a caller-visible buffer.
    pub fn is_materialized(&self) -> bool {
        !self.is_virtual && !self.desc.by_value
    }

    pub fn is_input(&self) -> bool {
        self.producer.is_none()
    }

    pub fn producer(&self) -> Option<usize> {
        self.producer
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub kind: OpKind,
    /// Chained operand; `None` only for the root.
    pub operand: Option<TensorUid>,
    pub side_inputs: Vec<TensorUid>,
    pub result: TensorUid,
    pub compute_dtype: DType,
    pub seq: usize,
}

impl OperatorNode {
    pub fn is_root(&self) -> bool {
        self.operand.is_none()
    }

    /// Operand first, then side inputs.
    pub fn inputs(&self) -> impl Iterator<Item = TensorUid> + '_ {
        self.operand.into_iter().chain(self.side_inputs.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorGraph {
    pub(crate) class: OpClass,
    pub(crate) label: String,
    pub(crate) tensors: BTreeMap<TensorUid, TensorNode>,
    /// Tensor declaration order.
    pub(crate) order: Vec<TensorUid>,
    pub(crate) ops: Vec<OperatorNode>,
    pub(crate) accumulators: Vec<TensorUid>,
}

impl OperatorGraph {
    pub(crate) fn empty(class: OpClass, label: String) -> Self {
        Self {
            class,
            label,
            tensors: BTreeMap::new(),
            order: Vec::new(),
            ops: Vec::new(),
            accumulators: Vec::new(),
        }
    }

    pub fn class(&self) -> OpClass {
        self.class
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ops(&self) -> &[OperatorNode] {
        &self.ops
    }

    pub fn root(&self) -> Option<&OperatorNode> {
        self.ops.first()
    }

    pub fn tensor(&self, uid: TensorUid) -> Option<&TensorNode> {
        self.tensors.get(&uid)
    }

    /// All tensors in declaration order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorNode> + '_ {
        self.order.iter().filter_map(|uid| self.tensors.get(uid))
    }

    /// Buffer-backed tensors in declaration order. This is the argument order
    /// of a variant pack.
    pub fn materialized(&self) -> Vec<&TensorNode> {
        self.tensors().filter(|t| t.is_materialized()).collect()
    }

    /// By-value scalar inputs in declaration order.
    pub fn scalar_inputs(&self) -> Vec<&TensorNode> {
        self.tensors().filter(|t| t.desc.by_value).collect()
    }

    /// Materialized op results.
    pub fn outputs(&self) -> Vec<&TensorNode> {
        self.tensors()
            .filter(|t| t.is_materialized() && !t.is_input())
            .collect()
    }

    pub fn find_role(&self, role: TensorRole) -> Option<&TensorNode> {
        self.tensors().find(|t| t.role == role)
    }

    /// Outputs that accumulate atomically and need zeroing before each run.
    pub fn accumulators(&self) -> &[TensorUid] {
        &self.accumulators
    }

    /// The first stochastic op, if any.
    pub fn stochastic_op(&self) -> Option<&OperatorNode> {
        self.ops.iter().find(|op| op.kind.is_stochastic())
    }

    /// `(seed, offset)` inputs feeding the stochastic op.
    pub fn rng_inputs(&self) -> Option<(TensorUid, TensorUid)> {
        let op = self.stochastic_op()?;
        match op.side_inputs.as_slice() {
            [seed, offset] => Some((*seed, *offset)),
            _ => None,
        }
    }

    /// Next free uid of a namespace: max of existing ids in it, plus one.
    pub fn next_uid(&self, ns: UidNamespace) -> TensorUid {
        let max = self
            .tensors
            .range(TensorUid(ns.base())..TensorUid(ns.base() + NAMESPACE_SPAN))
            .next_back()
            .map(|(uid, _)| uid.0);
        TensorUid(max.map_or(ns.base(), |m| m + 1))
    }

    /// Structural signature of the program, with constants inlined.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}:{}", self.class, self.label);
        for t in self.tensors() {
            let _ = write!(out, ";{}={}:{}", t.uid, t.role, t.desc);
            if let Some(c) = &t.constant {
                let _ = write!(out, "={c}");
            }
            if t.is_virtual {
                out.push('~');
            }
        }
        for op in &self.ops {
            let _ = write!(out, ";#{} {}={}(", op.seq, op.result, op.kind);
            match op.operand {
                Some(uid) => {
                    let _ = write!(out, "{uid}");
                }
                None => out.push('_'),
            }
            for uid in &op.side_inputs {
                let _ = write!(out, ",{uid}");
            }
            let _ = write!(out, ")@{}", op.compute_dtype);
        }
        for uid in &self.accumulators {
            let _ = write!(out, ";acc {uid}");
        }
        out
    }

    /// Short hash of [`OperatorGraph::signature`], binding engine configs to
    /// the graph they were enumerated for.
    pub fn graph_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.signature().hash(&mut hasher);
        hasher.finish()
    }

    /// Bipartite tensor/op graph: edges go from inputs to ops and from ops to
    /// their results.
    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        let mut tensor_idx: HashMap<TensorUid, NodeIndex> = HashMap::new();

        for t in self.tensors() {
            let mut label = format!("{} {} {}", t.uid, t.role, t.desc);
            if t.is_virtual {
                label.push_str(" (virtual)");
            }
            tensor_idx.insert(t.uid, g.add_node(label));
        }

        for op in &self.ops {
            let node = g.add_node(format!("#{} {}", op.seq, op.kind));
            for uid in op.inputs() {
                if let Some(src) = tensor_idx.get(&uid) {
                    g.add_edge(*src, node, ());
                }
            }
            if let Some(dst) = tensor_idx.get(&op.result) {
                g.add_edge(node, *dst, ());
            }
        }

        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Check every structural invariant of the graph.
    pub fn validate(&self) -> Result<()> {
        let Some(root) = self.ops.first() else {
            crate::structural!("graph `{}` has no operators", self.label);
        };
        if !root.is_root() || !root.kind.is_root_kind() {
            crate::structural!(
                "first operator must be a root compute op without operand, got `{}`",
                root.kind
            );
        }

        for t in self.tensors() {
            t.desc.validate()?;
            let ns = t.uid.namespace();
            match (t.producer, ns) {
                (None, Some(UidNamespace::Operand)) => {}
                (Some(_), Some(UidNamespace::Output | UidNamespace::Virtual)) => {}
                _ => crate::structural!("tensor {} declared in the wrong namespace", t.uid),
            }
            if ns == Some(UidNamespace::Virtual) && !t.is_virtual {
                crate::structural!("tensor {} in the virtual namespace is materialized", t.uid);
            }
            if t.desc.by_value && !t.is_input() {
                crate::structural!("by-value tensor {} must be a graph input", t.uid);
            }
        }

        for (seq, op) in self.ops.iter().enumerate() {
            if op.seq != seq {
                crate::structural!("operator {} out of sequence at {seq}", op.seq);
            }
            if seq > 0 && op.operand.is_none() {
                crate::structural!("more than one root: operator #{seq} has no operand");
            }
            let expected = op.kind.side_inputs(op.is_root());
            if op.side_inputs.len() != expected {
                crate::structural!(
                    "`{}` takes {expected} side inputs, got {}",
                    op.kind,
                    op.side_inputs.len()
                );
            }
            for uid in op.inputs() {
                let Some(t) = self.tensors.get(&uid) else {
                    crate::structural!("operator #{seq} references undeclared tensor {uid}");
                };
                if t.producer.is_some_and(|p| p >= seq) {
                    crate::structural!("operator #{seq} references {uid} before it is produced");
                }
            }
            match self.tensors.get(&op.result) {
                Some(t) if t.producer == Some(seq) => {}
                _ => crate::structural!("operator #{seq} result {} is not registered", op.result),
            }
        }

        if self.outputs().is_empty() {
            crate::structural!("graph `{}` has no materialized output", self.label);
        }
        for uid in &self.accumulators {
            match self.tensors.get(uid) {
                Some(t) if t.is_materialized() && !t.is_input() && t.desc.dtype == DType::F32 => {}
                _ => crate::structural!("accumulator {uid} must be a materialized f32 output"),
            }
        }
        if is_cyclic_directed(&self.to_petgraph()) {
            crate::structural!("graph `{}` contains a cycle", self.label);
        }
        Ok(())
    }
}
