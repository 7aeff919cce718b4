use std::path::PathBuf;

use crate::Result;

/// Independent exclusion switches. All default on: the matching engines are
/// dropped unless explicitly allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExclusionToggles {
    pub winograd: bool,
    pub nondeterministic: bool,
    /// Only applies when the precision policy forbids reduced-precision
    /// accumulation.
    pub tensor_core: bool,
}

impl Default for ExclusionToggles {
    fn default() -> Self {
        Self {
            winograd: true,
            nondeterministic: true,
            tensor_core: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PrecisionPolicy {
    pub allow_reduced_precision_reduction: bool,
}

/// Policy for turning a graph into a plan.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BuildOptions {
    /// Stop at the first plan that builds and never accept a
    /// nondeterministic engine.
    pub require_determinism: bool,
    /// Also run the fallback heuristic pass when the instant pass is not empty.
    pub exhaustive_search: bool,
    /// Profile every viable plan and keep the fastest. Ignored under
    /// `require_determinism`.
    pub autotune: bool,
    pub exclusion: ExclusionToggles,
    pub precision: PrecisionPolicy,
    /// Extra errata table merged over the embedded one.
    pub errata_path: Option<PathBuf>,
    /// Persisted fingerprint → algorithm store used for replay.
    pub algorithm_store: Option<PathBuf>,
    /// Candidates needing more scratch than this fail to build.
    pub workspace_limit: Option<u64>,
}

const ENV_DETERMINISTIC: &str = "FUSEPLAN_DETERMINISTIC";
const ENV_EXHAUSTIVE: &str = "FUSEPLAN_EXHAUSTIVE";
const ENV_AUTOTUNE: &str = "FUSEPLAN_AUTOTUNE";
const ENV_ALLOW_WINOGRAD: &str = "FUSEPLAN_ALLOW_WINOGRAD";
const ENV_ALLOW_NONDETERMINISTIC: &str = "FUSEPLAN_ALLOW_NONDETERMINISTIC";
const ENV_ALLOW_TENSOR_CORE: &str = "FUSEPLAN_ALLOW_TENSOR_CORE";
const ENV_ALLOW_REDUCED_PRECISION: &str = "FUSEPLAN_ALLOW_REDUCED_PRECISION";
const ENV_ERRATA_PATH: &str = "FUSEPLAN_ERRATA_PATH";
const ENV_ALGORITHM_CACHE: &str = "FUSEPLAN_ALGORITHM_CACHE";
const ENV_WORKSPACE_LIMIT: &str = "FUSEPLAN_WORKSPACE_LIMIT";

fn parse_flag(var: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" | "yes" => Ok(true),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no" => Ok(false),
        other => crate::structural!("{var}: expected a boolean, got `{other}`"),
    }
}

impl BuildOptions {
    /// Defaults overlaid with the `FUSEPLAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay settings read through `lookup`. Unparsable values are
    /// structural errors naming the variable.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |var: &str| -> Result<Option<bool>> {
            lookup(var).map(|raw| parse_flag(var, &raw)).transpose()
        };

        if let Some(v) = flag(ENV_DETERMINISTIC)? {
            self.require_determinism = v;
        }
        if let Some(v) = flag(ENV_EXHAUSTIVE)? {
            self.exhaustive_search = v;
        }
        if let Some(v) = flag(ENV_AUTOTUNE)? {
            self.autotune = v;
        }
        if let Some(v) = flag(ENV_ALLOW_WINOGRAD)? {
            self.exclusion.winograd = !v;
        }
        if let Some(v) = flag(ENV_ALLOW_NONDETERMINISTIC)? {
            self.exclusion.nondeterministic = !v;
        }
        if let Some(v) = flag(ENV_ALLOW_TENSOR_CORE)? {
            self.exclusion.tensor_core = !v;
        }
        if let Some(v) = flag(ENV_ALLOW_REDUCED_PRECISION)? {
            self.precision.allow_reduced_precision_reduction = v;
        }
        if let Some(path) = lookup(ENV_ERRATA_PATH).filter(|p| !p.trim().is_empty()) {
            self.errata_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_ALGORITHM_CACHE).filter(|p| !p.trim().is_empty()) {
            self.algorithm_store = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup(ENV_WORKSPACE_LIMIT) {
            match raw.trim().parse::<u64>() {
                Ok(limit) => self.workspace_limit = Some(limit),
                Err(_) => crate::structural!(
                    "{ENV_WORKSPACE_LIMIT}: expected a byte count, got `{raw}`"
                ),
            }
        }
        Ok(self)
    }

    /// Whether nondeterministic engines are dropped. Always true when
    /// determinism is required.
    pub fn excludes_nondeterministic(&self) -> bool {
        self.require_determinism || self.exclusion.nondeterministic
    }

    /// Whether every surviving candidate should be built and profiled.
    pub fn wants_autotune(&self) -> bool {
        self.autotune && !self.require_determinism
    }
}
