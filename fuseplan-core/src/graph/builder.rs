use tracing::debug;

use super::{
    ConvParams, OpClass, OpKind, OperatorGraph, OperatorNode, TensorNode, TensorRole, TensorUid,
    UidNamespace, NAMESPACE_SPAN,
};
use crate::{DType, Result, ScalarValue, TensorDesc};

/// Where the result of a new operator lands.
#[derive(Debug, Clone)]
pub enum ResultSlot {
    /// A fresh id in the virtual namespace.
    Virtual(TensorDesc),
    /// A fresh id in the output namespace, materialized even if consumed later.
    Output(TensorRole, TensorDesc),
    /// A caller-chosen output id, virtualized once a later op consumes it.
    Declared(i64, TensorDesc),
}

/// Appends tensors and operators one step at a time, rejecting any step that
/// would break a graph invariant.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: OperatorGraph,
}

impl GraphBuilder {
    pub fn new(class: OpClass, label: impl Into<String>) -> Self {
        Self {
            graph: OperatorGraph::empty(class, label.into()),
        }
    }

    fn insert(&mut self, node: TensorNode) {
        self.graph.order.push(node.uid);
        self.graph.tensors.insert(node.uid, node);
    }

    /// Declare a graph input in the operand namespace.
    pub fn input(&mut self, role: TensorRole, desc: TensorDesc) -> Result<TensorUid> {
        desc.validate()?;
        let uid = self.graph.next_uid(UidNamespace::Operand);
        if uid.0 >= UidNamespace::Operand.base() + NAMESPACE_SPAN {
            crate::structural!("operand namespace exhausted");
        }
        self.insert(TensorNode {
            uid,
            desc,
            role,
            constant: None,
            is_virtual: false,
            pinned: false,
            producer: None,
        });
        Ok(uid)
    }

    /// Declare a by-value scalar input whose value is fixed at build time.
    pub fn constant(&mut self, role: TensorRole, value: ScalarValue) -> Result<TensorUid> {
        let uid = self.input(role, TensorDesc::scalar(value.dtype()))?;
        if let Some(node) = self.graph.tensors.get_mut(&uid) {
            node.constant = Some(value);
        }
        Ok(uid)
    }

    /// Append an operator. The first operator must be a root compute op with
    /// no operand; every later one must chain from an already declared tensor.
    pub fn op(
        &mut self,
        kind: OpKind,
        operand: Option<TensorUid>,
        side_inputs: &[TensorUid],
        compute_dtype: DType,
        slot: ResultSlot,
    ) -> Result<TensorUid> {
        let seq = self.graph.ops.len();
        match (seq, operand) {
            (0, Some(_)) => crate::structural!("root `{kind}` must not have an operand"),
            (0, None) if !kind.is_root_kind() => {
                crate::structural!("`{kind}` cannot be the root operator")
            }
            (_, None) if seq > 0 => {
                crate::structural!("more than one root: `{kind}` at #{seq} has no operand")
            }
            _ => {}
        }
        let expected = kind.side_inputs(operand.is_none());
        if side_inputs.len() != expected {
            crate::structural!(
                "`{kind}` takes {expected} side inputs, got {}",
                side_inputs.len()
            );
        }
        for uid in operand.iter().chain(side_inputs) {
            if !self.graph.tensors.contains_key(uid) {
                crate::structural!("`{kind}` references undeclared tensor {uid}");
            }
        }

        let (uid, desc, role, is_virtual, pinned) = match slot {
            ResultSlot::Virtual(desc) => (
                self.graph.next_uid(UidNamespace::Virtual),
                desc,
                TensorRole::Intermediate,
                true,
                false,
            ),
            ResultSlot::Output(role, desc) => (
                self.graph.next_uid(UidNamespace::Output),
                desc,
                role,
                false,
                true,
            ),
            ResultSlot::Declared(id, desc) => {
                if !(0..NAMESPACE_SPAN).contains(&id) {
                    crate::structural!("declared id {id} outside of the output namespace");
                }
                (TensorUid(id), desc, TensorRole::Output, false, false)
            }
        };
        if self.graph.tensors.contains_key(&uid) {
            crate::structural!("id collision on {uid}");
        }
        desc.validate()?;

        // Consuming an op result hides it from the caller.
        for input in operand.iter().chain(side_inputs) {
            if let Some(node) = self.graph.tensors.get_mut(input) {
                if node.producer.is_some() && !node.pinned {
                    node.is_virtual = true;
                }
            }
        }

        self.insert(TensorNode {
            uid,
            desc,
            role,
            constant: None,
            is_virtual,
            pinned,
            producer: Some(seq),
        });
        self.graph.ops.push(OperatorNode {
            kind,
            operand,
            side_inputs: side_inputs.to_vec(),
            result: uid,
            compute_dtype,
            seq,
        });
        Ok(uid)
    }

    /// Mark a materialized f32 output as accumulated atomically.
    pub fn accumulate(&mut self, uid: TensorUid) -> Result<()> {
        if !self.graph.tensors.contains_key(&uid) {
            crate::structural!("cannot accumulate into undeclared tensor {uid}");
        }
        self.graph.accumulators.push(uid);
        Ok(())
    }

    pub fn graph(&self) -> &OperatorGraph {
        &self.graph
    }

    pub fn finish(self) -> Result<OperatorGraph> {
        self.graph.validate()?;
        debug!(
            label = self.graph.label,
            ops = self.graph.ops.len(),
            tensors = self.graph.tensors.len(),
            "built operator graph"
        );
        Ok(self.graph)
    }
}

/// One `UID:[DTYPE]OPNAME(OPERAND_UID)` record of a declarative op sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub uid: i64,
    pub dtype: DType,
    pub kind: OpKind,
    pub operand: Option<i64>,
}

fn parse_record(record: &str) -> Result<OpRecord> {
    let malformed = || crate::Error::structural(format!("malformed record `{record}`"));

    let (uid, rest) = record.split_once(':').ok_or_else(malformed)?;
    let uid: i64 = uid.trim().parse().map_err(|_| malformed())?;
    let (dtype, rest) = rest
        .trim_start()
        .strip_prefix('[')
        .and_then(|r| r.split_once(']'))
        .ok_or_else(malformed)?;
    let Some(dtype) = DType::parse(dtype.trim()) else {
        crate::structural!("unknown dtype `{dtype}` in record `{record}`");
    };
    let (name, rest) = rest.split_once('(').ok_or_else(malformed)?;
    let operand = rest.trim_end().strip_suffix(')').ok_or_else(malformed)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(malformed());
    }
    let Some(kind) = OpKind::from_record_name(name) else {
        crate::structural!("unknown op `{name}` in record `{record}`");
    };
    let operand = match operand.trim() {
        "" => None,
        s => Some(s.parse::<i64>().map_err(|_| malformed())?),
    };
    Ok(OpRecord {
        uid,
        dtype,
        kind,
        operand,
    })
}

/// Parse a semicolon-terminated sequence of records and check its chaining:
/// the first record is the root, every later record names an earlier uid.
pub fn parse_op_sequence(text: &str) -> Result<Vec<OpRecord>> {
    let text = text.trim();
    let Some(body) = text.strip_suffix(';') else {
        crate::structural!("op sequence must end with `;`");
    };
    let mut records: Vec<OpRecord> = Vec::new();
    for raw in body.split(';') {
        let record = parse_record(raw.trim())?;
        match (records.is_empty(), record.operand) {
            (true, Some(_)) => {
                crate::structural!("root record {} must not have an operand", record.uid)
            }
            (true, None) if !record.kind.is_root_kind() => {
                crate::structural!("record {} `{}` cannot be the root", record.uid, record.kind)
            }
            (false, None) => crate::structural!("more than one root: record {}", record.uid),
            (false, Some(operand)) if !records.iter().any(|r| r.uid == operand) => {
                crate::structural!(
                    "record {} references undeclared operand {operand}",
                    record.uid
                )
            }
            _ => {}
        }
        if records.iter().any(|r| r.uid == record.uid) {
            crate::structural!("duplicate record id {}", record.uid);
        }
        records.push(record);
    }
    Ok(records)
}

/// Shapes a declarative sequence cannot express itself.
#[derive(Debug, Clone)]
pub struct DeclaredInputs {
    pub lhs: TensorDesc,
    pub rhs: TensorDesc,
    /// Dims of the root result and of every pointwise result.
    pub output_dims: Vec<i64>,
    pub conv: Option<ConvParams>,
}

fn compute_dtype_for(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        d if d.is_float() => DType::F32,
        _ => DType::S32,
    }
}

impl OperatorGraph {
    /// Build a graph from a declarative op sequence. Fails without producing
    /// any partial graph.
    pub fn from_op_sequence(text: &str, inputs: &DeclaredInputs) -> Result<Self> {
        let records = parse_op_sequence(text)?;
        let root = &records[0];
        let class = match root.kind {
            OpKind::Convolution(_) => OpClass::Convolution,
            _ => OpClass::Matmul,
        };
        let mut b = GraphBuilder::new(class, "declarative");

        let (lhs_role, rhs_role) = match class {
            OpClass::Convolution => (TensorRole::Input, TensorRole::Filter),
            _ => (TensorRole::Lhs, TensorRole::Rhs),
        };
        let lhs = b.input(lhs_role, inputs.lhs.clone())?;
        let rhs = b.input(rhs_role, inputs.rhs.clone())?;
        let root_kind = match (&root.kind, &inputs.conv) {
            (OpKind::Convolution(_), Some(params)) => OpKind::Convolution(params.clone()),
            (kind, _) => kind.clone(),
        };
        b.op(
            root_kind,
            None,
            &[lhs, rhs],
            compute_dtype_for(root.dtype),
            ResultSlot::Declared(root.uid, TensorDesc::new(root.dtype, inputs.output_dims.clone())),
        )?;

        for record in &records[1..] {
            let dims = match record.kind {
                OpKind::Reduction(_) => vec![1; inputs.output_dims.len()],
                _ => inputs.output_dims.clone(),
            };
            let mut side = Vec::new();
            for _ in 0..record.kind.side_inputs(false) {
                let uid = match record.kind {
                    OpKind::Pointwise(super::PointwiseMode::Scale) => {
                        b.input(TensorRole::Scale, TensorDesc::scalar(DType::F32))?
                    }
                    _ => b.input(
                        TensorRole::SideInput,
                        TensorDesc::new(record.dtype, inputs.output_dims.clone()),
                    )?,
                };
                side.push(uid);
            }
            b.op(
                record.kind.clone(),
                record.operand.map(TensorUid),
                &side,
                compute_dtype_for(record.dtype),
                ResultSlot::Declared(record.uid, TensorDesc::new(record.dtype, dims)),
            )?;
        }
        b.finish()
    }
}
