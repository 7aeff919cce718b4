use fuseplan_core::{
    graph::{parse_op_sequence, ConvParams, DeclaredInputs, OpKind, PointwiseMode, ReductionMode},
    DType, OpClass, OperatorGraph, TensorDesc, TensorRole, TensorUid,
};

fn conv_inputs() -> DeclaredInputs {
    DeclaredInputs {
        lhs: TensorDesc::new(DType::F32, [1, 3, 8, 8]),
        rhs: TensorDesc::new(DType::F32, [4, 3, 3, 3]),
        output_dims: vec![1, 4, 6, 6],
        conv: Some(ConvParams::unit(2)),
    }
}

fn matmul_inputs() -> DeclaredInputs {
    DeclaredInputs {
        lhs: TensorDesc::new(DType::F32, [4, 8]),
        rhs: TensorDesc::new(DType::F32, [8, 16]),
        output_dims: vec![4, 16],
        conv: None,
    }
}

#[test]
fn conv_add_relu_sequence() {
    let graph =
        OperatorGraph::from_op_sequence("0:[f32]conv();1:[f32]add(0);2:[f32]relu(1);", &conv_inputs())
            .unwrap();
    assert_eq!(graph.class(), OpClass::Convolution);

    let ops = graph.ops();
    assert_eq!(ops.len(), 3);
    assert!(ops[0].is_root());
    assert_eq!(ops[0].result, TensorUid(0));
    assert!(matches!(ops[0].kind, OpKind::Convolution(_)));
    assert_eq!(ops[1].result, TensorUid(1));
    assert_eq!(ops[2].result, TensorUid(2));

    assert!(graph.tensor(TensorUid(0)).unwrap().is_virtual());
    assert!(graph.tensor(TensorUid(1)).unwrap().is_virtual());
    assert!(!graph.tensor(TensorUid(2)).unwrap().is_virtual());

    let outputs = graph.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].uid, TensorUid(2));

    // The add record brings its own side input.
    let side = graph.find_role(TensorRole::SideInput).unwrap();
    assert_eq!(side.desc.dims, vec![1, 4, 6, 6]);
    assert_eq!(graph.find_role(TensorRole::Input).unwrap().desc.dims, vec![1, 3, 8, 8]);
    assert_eq!(graph.find_role(TensorRole::Filter).unwrap().desc.dims, vec![4, 3, 3, 3]);
}

#[test]
fn whitespace_between_records_is_ignored() {
    let graph = OperatorGraph::from_op_sequence(
        " 0:[f32]matmul() ;\n 1:[f32]gelu(0) ; ",
        &matmul_inputs(),
    )
    .unwrap();
    assert_eq!(graph.class(), OpClass::Matmul);
    assert_eq!(graph.ops()[1].kind, OpKind::Pointwise(PointwiseMode::Gelu));
    assert_eq!(graph.find_role(TensorRole::Lhs).unwrap().desc.dims, vec![4, 8]);
}

#[test]
fn reductions_collapse_to_unit_dims() {
    let graph = OperatorGraph::from_op_sequence(
        "0:[f32]matmul();1:[f32]amax(0);",
        &matmul_inputs(),
    )
    .unwrap();
    let amax = graph.tensor(TensorUid(1)).unwrap();
    assert_eq!(amax.desc.dims, vec![1, 1]);
    assert_eq!(graph.ops()[1].kind, OpKind::Reduction(ReductionMode::AbsMax));
}

#[test]
fn scale_records_take_a_by_value_scalar() {
    let graph = OperatorGraph::from_op_sequence(
        "0:[f32]matmul();1:[f32]scale(0);",
        &matmul_inputs(),
    )
    .unwrap();
    let scalars = graph.scalar_inputs();
    assert_eq!(scalars.len(), 1);
    assert_eq!(scalars[0].role, TensorRole::Scale);
    assert!(scalars[0].constant.is_none());
    assert!(!scalars[0].is_materialized());
}

#[test]
fn undeclared_operand_is_structural() {
    let err = OperatorGraph::from_op_sequence(
        "0:[f32]matmul();1:[f32]relu(7);",
        &matmul_inputs(),
    )
    .unwrap_err();
    assert!(err.is_structural());
    // Nothing is produced before the chain is validated.
    assert!(parse_op_sequence("0:[f32]matmul();1:[f32]relu(7);").is_err());
}

#[test]
fn malformed_sequences_are_structural() {
    for text in [
        "",
        "0:[f32]matmul()",
        "0:f32 matmul();",
        "x:[f32]matmul();",
        "0:[f13]matmul();",
        "0:[f32]frobnicate();",
        "0:[f32]matmul(;",
        "0:[f32]matmul(3);",
        "0:[f32]relu();",
        "0:[f32]matmul();1:[f32]relu();",
        "0:[f32]matmul();0:[f32]relu(0);",
        "0:[f32]matmul();1:[f32]relu(x);",
    ] {
        let err = parse_op_sequence(text).unwrap_err();
        assert!(err.is_structural(), "`{text}` should be structural, got {err}");
    }
}

#[test]
fn parsed_records_keep_order_and_dtypes() {
    let records = parse_op_sequence("0:[bf16]matmul();1:[f32]cvt(0);2:[f32]tanh(1);").unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].dtype, DType::BF16);
    assert_eq!(records[0].operand, None);
    assert_eq!(records[1].operand, Some(0));
    assert_eq!(records[2].kind, OpKind::Pointwise(PointwiseMode::Tanh));
}

#[test]
fn second_root_is_rejected() {
    let err = parse_op_sequence("0:[f32]conv();1:[f32]conv();").unwrap_err();
    assert!(err.is_structural());
    assert!(err.to_string().contains("more than one root"));
}
