//! Pre-compilation exclusion of known-bad and policy-disallowed engines.
//!
//! The static errata table is embedded at build time and may be patched by a
//! runtime file with the same schema. Entries match on op class, engine id,
//! a subset of knob values and a half-open `[min_version, max_version)`
//! range of the engine library version.

use std::{fmt::Display, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    backend::DeviceDescription,
    config::BuildOptions,
    engine::EngineConfig,
    graph::OpClass,
    Context, Result,
};

const EMBEDDED_ERRATA: &str = include_str!("errata/errata.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrataEntry {
    pub op_class: OpClass,
    pub engine_id: i64,
    /// Every listed knob must carry exactly this value for a match.
    #[serde(default)]
    pub knobs: Vec<(i64, i64)>,
    #[serde(default)]
    pub min_version: u32,
    /// Exclusive upper bound; `None` is unbounded.
    #[serde(default)]
    pub max_version: Option<u32>,
    #[serde(default)]
    pub reason: String,
}

impl ErrataEntry {
    pub fn matches(&self, class: OpClass, config: &EngineConfig, version: u32) -> bool {
        self.op_class == class
            && self.engine_id == config.engine_id
            && version >= self.min_version
            && self.max_version.map_or(true, |max| version < max)
            && self.knobs.iter().all(|(k, v)| config.knob(*k) == Some(*v))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrataTable {
    #[serde(default)]
    pub entries: Vec<ErrataEntry>,
}

impl ErrataTable {
    pub fn embedded() -> Result<Self> {
        Ok(serde_json::from_str(EMBEDDED_ERRATA)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading errata table {}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn merge(mut self, other: ErrataTable) -> Self {
        for entry in other.entries {
            if !self.entries.contains(&entry) {
                self.entries.push(entry);
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExclusionReason {
    Errata,
    Winograd,
    Nondeterministic,
    TensorCore,
}

impl Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Errata => "errata",
            Self::Winograd => "winograd",
            Self::Nondeterministic => "nondeterministic",
            Self::TensorCore => "tensor core",
        })
    }
}

/// Drops candidates before any of them is compiled.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    table: ErrataTable,
    version: u32,
    exclude_winograd: bool,
    exclude_nondeterministic: bool,
    exclude_tensor_core: bool,
}

impl ExclusionFilter {
    /// No table entries and every toggle off.
    pub fn empty(version: u32) -> Self {
        Self {
            table: ErrataTable::default(),
            version,
            exclude_winograd: false,
            exclude_nondeterministic: false,
            exclude_tensor_core: false,
        }
    }

    /// The embedded table, patched from `opts.errata_path`, with the toggles
    /// of `opts`.
    pub fn new(opts: &BuildOptions, device: &DeviceDescription) -> Result<Self> {
        let mut table = ErrataTable::embedded()?;
        if let Some(path) = &opts.errata_path {
            table = table.merge(ErrataTable::load(path)?);
        }
        Ok(Self::with_table(table, opts, device.backend_version))
    }

    pub fn with_table(table: ErrataTable, opts: &BuildOptions, version: u32) -> Self {
        Self {
            table,
            version,
            exclude_winograd: opts.exclusion.winograd,
            exclude_nondeterministic: opts.excludes_nondeterministic(),
            exclude_tensor_core: opts.exclusion.tensor_core
                && !opts.precision.allow_reduced_precision_reduction,
        }
    }

    pub fn table(&self) -> &ErrataTable {
        &self.table
    }

    /// Why `config` is dropped, or `None` if it survives.
    pub fn exclusion_reason(
        &self,
        class: OpClass,
        config: &EngineConfig,
    ) -> Option<ExclusionReason> {
        if self
            .table
            .entries
            .iter()
            .any(|e| e.matches(class, config, self.version))
        {
            return Some(ExclusionReason::Errata);
        }
        let notes = &config.notes;
        if self.exclude_winograd && notes.winograd {
            Some(ExclusionReason::Winograd)
        } else if self.exclude_nondeterministic && notes.nondeterministic {
            Some(ExclusionReason::Nondeterministic)
        } else if self.exclude_tensor_core && notes.tensor_core {
            Some(ExclusionReason::TensorCore)
        } else {
            None
        }
    }

    pub fn allows(&self, class: OpClass, config: &EngineConfig) -> bool {
        match self.exclusion_reason(class, config) {
            Some(reason) => {
                trace!(%config, %reason, "excluded");
                false
            }
            None => true,
        }
    }

    /// Keep the surviving candidates in their original order.
    pub fn filter(&self, class: OpClass, candidates: Vec<EngineConfig>) -> Vec<EngineConfig> {
        let before = candidates.len();
        let kept: Vec<_> = candidates
            .into_iter()
            .filter(|c| self.allows(class, c))
            .collect();
        if kept.len() != before {
            debug!(%class, before, after = kept.len(), "exclusion filter dropped candidates");
        }
        kept
    }
}
