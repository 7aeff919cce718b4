use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::{graph::OperatorGraph, AlgorithmDescriptor};

/// Well-known tuning knob ids. Backends may define more.
pub mod knob {
    pub const TILE_M: i64 = 0;
    pub const TILE_N: i64 = 1;
    pub const SPLIT_K: i64 = 2;
    pub const STAGES: i64 = 3;
    pub const SWIZZLE: i64 = 4;
    pub const WINOGRAD_TILE: i64 = 5;
    pub const USE_TENSOR_CORE: i64 = 6;
}

/// Numeric properties of an engine relevant to exclusion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NumericNotes {
    pub nondeterministic: bool,
    pub tensor_core: bool,
    pub winograd: bool,
}

impl NumericNotes {
    pub const NONE: NumericNotes = NumericNotes {
        nondeterministic: false,
        tensor_core: false,
        winograd: false,
    };
}

/// Which heuristic pass to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeuristicMode {
    /// Fast, narrow, ranked.
    Instant,
    /// Wider, slower, used when the instant pass is empty or exhaustive
    /// search is requested.
    Fallback,
}

/// A backend execution strategy candidate for one specific graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub engine_id: i64,
    pub knobs: BTreeMap<i64, i64>,
    pub notes: NumericNotes,
    graph_id: u64,
}

impl EngineConfig {
    pub fn new(graph: &OperatorGraph, engine_id: i64, knobs: BTreeMap<i64, i64>) -> Self {
        Self {
            engine_id,
            knobs,
            notes: NumericNotes::NONE,
            graph_id: graph.graph_id(),
        }
    }

    /// Reconstruct a config from a stored descriptor.
    pub fn from_descriptor(graph: &OperatorGraph, descriptor: &AlgorithmDescriptor) -> Self {
        Self::new(graph, descriptor.engine_id, descriptor.knobs.clone())
    }

    pub fn with_notes(mut self, notes: NumericNotes) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_knob(mut self, id: i64, value: i64) -> Self {
        self.knobs.insert(id, value);
        self
    }

    /// A config is only valid against the graph it was enumerated for.
    pub fn is_for(&self, graph: &OperatorGraph) -> bool {
        self.graph_id == graph.graph_id()
    }

    pub fn knob(&self, id: i64) -> Option<i64> {
        self.knobs.get(&id).copied()
    }
}

impl Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "eng{}", self.engine_id)?;
        for (k, v) in &self.knobs {
            write!(f, " k{k}={v}")?;
        }
        Ok(())
    }
}
