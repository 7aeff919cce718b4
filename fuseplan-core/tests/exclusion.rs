use std::io::Write;

use fuseplan_core::{
    engine::knob,
    errata::{ErrataEntry, ExclusionReason},
    graph::ConvParams,
    Backend, BuildOptions, ConvShape, DType, EngineConfig, ErrataTable, ExclusionFilter,
    FusionPattern, HeuristicMode, HostBackend, NumericNotes, OpClass, OperatorGraph, TensorDesc,
};

mod common;

fn conv_graph() -> OperatorGraph {
    FusionPattern::ConvAddBiasActivation {
        shape: ConvShape {
            input: TensorDesc::new(DType::F32, [1, 3, 8, 8]),
            filter: TensorDesc::new(DType::F32, [4, 3, 3, 3]),
            output: TensorDesc::new(DType::F32, [1, 4, 6, 6]),
            params: ConvParams::unit(2),
        },
        use_side_input: false,
        use_bias: true,
        activation: None,
    }
    .build()
    .unwrap()
}

fn winograd(graph: &OperatorGraph, tile: i64) -> EngineConfig {
    EngineConfig::new(graph, 1, [(knob::WINOGRAD_TILE, tile)].into_iter().collect()).with_notes(
        NumericNotes {
            winograd: true,
            ..NumericNotes::NONE
        },
    )
}

fn permissive() -> BuildOptions {
    let mut opts = BuildOptions::default();
    opts.exclusion.winograd = false;
    opts.exclusion.nondeterministic = false;
    opts.exclusion.tensor_core = false;
    opts
}

#[test]
fn embedded_table_parses() {
    let table = ErrataTable::embedded().unwrap();
    assert_eq!(table.entries.len(), 3);
    assert!(table
        .entries
        .iter()
        .any(|e| e.op_class == OpClass::AttentionBackward && e.engine_id == 0));
}

#[test]
fn errata_match_on_knobs_and_version_range() {
    let graph = conv_graph();
    let table = ErrataTable::embedded().unwrap();
    let opts = permissive();

    let inside = ExclusionFilter::with_table(table.clone(), &opts, 90_100);
    assert_eq!(
        inside.exclusion_reason(OpClass::Convolution, &winograd(&graph, 4)),
        Some(ExclusionReason::Errata)
    );
    // Only the listed knob value is affected.
    assert_eq!(inside.exclusion_reason(OpClass::Convolution, &winograd(&graph, 2)), None);
    // Same engine id under another op class is unaffected.
    assert_eq!(inside.exclusion_reason(OpClass::Matmul, &winograd(&graph, 4)), None);

    // The upper bound is exclusive, the lower inclusive.
    let fixed = ExclusionFilter::with_table(table.clone(), &opts, 90_200);
    assert!(fixed.allows(OpClass::Convolution, &winograd(&graph, 4)));
    let first = ExclusionFilter::with_table(table.clone(), &opts, 90_000);
    assert!(!first.allows(OpClass::Convolution, &winograd(&graph, 4)));
    let older = ExclusionFilter::with_table(table, &opts, 89_999);
    assert!(older.allows(OpClass::Convolution, &winograd(&graph, 4)));
}

#[test]
fn toggles_default_on() {
    let graph = conv_graph();
    let filter = ExclusionFilter::with_table(ErrataTable::default(), &BuildOptions::default(), 0);

    assert_eq!(
        filter.exclusion_reason(OpClass::Convolution, &winograd(&graph, 2)),
        Some(ExclusionReason::Winograd)
    );
    let nondet = EngineConfig::new(&graph, 3, Default::default()).with_notes(NumericNotes {
        nondeterministic: true,
        ..NumericNotes::NONE
    });
    assert_eq!(
        filter.exclusion_reason(OpClass::Convolution, &nondet),
        Some(ExclusionReason::Nondeterministic)
    );
    let tensor_core = EngineConfig::new(&graph, 2, Default::default()).with_notes(NumericNotes {
        tensor_core: true,
        ..NumericNotes::NONE
    });
    assert_eq!(
        filter.exclusion_reason(OpClass::Convolution, &tensor_core),
        Some(ExclusionReason::TensorCore)
    );
    let plain = EngineConfig::new(&graph, 0, Default::default());
    assert!(filter.allows(OpClass::Convolution, &plain));
}

#[test]
fn tensor_core_toggle_only_applies_without_reduced_precision() {
    let graph = conv_graph();
    let tensor_core = EngineConfig::new(&graph, 2, Default::default()).with_notes(NumericNotes {
        tensor_core: true,
        ..NumericNotes::NONE
    });
    let mut opts = BuildOptions::default();
    opts.precision.allow_reduced_precision_reduction = true;
    let filter = ExclusionFilter::with_table(ErrataTable::default(), &opts, 0);
    assert!(filter.allows(OpClass::Convolution, &tensor_core));
}

#[test]
fn determinism_overrides_the_nondeterministic_toggle() {
    let graph = conv_graph();
    let nondet = EngineConfig::new(&graph, 3, Default::default()).with_notes(NumericNotes {
        nondeterministic: true,
        ..NumericNotes::NONE
    });
    let mut opts = permissive();
    assert!(ExclusionFilter::with_table(ErrataTable::default(), &opts, 0)
        .allows(OpClass::Convolution, &nondet));
    opts.require_determinism = true;
    assert!(!ExclusionFilter::with_table(ErrataTable::default(), &opts, 0)
        .allows(OpClass::Convolution, &nondet));
}

#[test]
fn filtering_is_idempotent_and_order_preserving() {
    let backend = HostBackend::new();
    let graph = conv_graph();
    let mut candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();
    candidates.extend(backend.query_engines(&graph, HeuristicMode::Fallback).unwrap());

    let mut opts = BuildOptions::default();
    opts.exclusion.tensor_core = false;
    let filter = ExclusionFilter::new(&opts, backend.device()).unwrap();

    let once = filter.filter(OpClass::Convolution, candidates.clone());
    let twice = filter.filter(OpClass::Convolution, once.clone());
    assert_eq!(once, twice);
    assert!(!once.is_empty() && once.len() < candidates.len());

    let ids: Vec<i64> = once.iter().map(|c| c.engine_id).collect();
    let mut expected: Vec<i64> = candidates
        .iter()
        .filter(|c| filter.allows(OpClass::Convolution, c))
        .map(|c| c.engine_id)
        .collect();
    assert_eq!(ids, expected);
    expected.dedup();
    assert_eq!(expected, vec![0, 2, 4]);
}

#[test]
fn empty_filter_keeps_everything() {
    let backend = HostBackend::new();
    let graph = conv_graph();
    let candidates = backend.query_engines(&graph, HeuristicMode::Instant).unwrap();
    let filter = ExclusionFilter::empty(backend.device().backend_version);
    assert_eq!(filter.filter(OpClass::Convolution, candidates.clone()), candidates);
}

#[test]
fn runtime_table_is_merged() {
    let graph = conv_graph();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"entries": [{{"op_class": "convolution", "engine_id": 0, "min_version": 0}}]}}"#
    )
    .unwrap();

    let mut opts = permissive();
    opts.errata_path = Some(file.path().to_path_buf());
    let backend = HostBackend::new();
    let filter = ExclusionFilter::new(&opts, backend.device()).unwrap();
    assert_eq!(filter.table().entries.len(), 4);
    assert_eq!(
        filter.exclusion_reason(
            OpClass::Convolution,
            &EngineConfig::new(&graph, 0, Default::default())
        ),
        Some(ExclusionReason::Errata)
    );

    // Merging the same table again adds nothing.
    let patched = filter.table().clone();
    let merged = patched.clone().merge(patched);
    assert_eq!(merged.entries.len(), 4);
}

#[test]
fn missing_runtime_table_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = BuildOptions::default();
    opts.errata_path = Some(dir.path().join("missing.json"));
    let backend = HostBackend::new();
    let err = ExclusionFilter::new(&opts, backend.device()).unwrap_err();
    assert!(err.to_string().contains("missing.json"));
}

#[test]
fn entry_without_upper_bound_matches_every_later_version() {
    let graph = conv_graph();
    let entry = ErrataEntry {
        op_class: OpClass::Convolution,
        engine_id: 0,
        knobs: vec![],
        min_version: 100,
        max_version: None,
        reason: String::new(),
    };
    let config = EngineConfig::new(&graph, 0, Default::default());
    assert!(!entry.matches(OpClass::Convolution, &config, 99));
    assert!(entry.matches(OpClass::Convolution, &config, u32::MAX));
}
