use tracing::{debug, warn};

use crate::{
    backend::Backend,
    engine::{EngineConfig, HeuristicMode},
    errata::ExclusionFilter,
    graph::OperatorGraph,
    Result,
};

/// Ranked candidates surviving exclusion. May contain duplicates when both
/// heuristic passes ran.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub configs: Vec<EngineConfig>,
    /// Candidates dropped by the exclusion filter.
    pub excluded: usize,
    pub used_fallback: bool,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }
}

/// Queries a backend for ranked engine candidates, applying the exclusion
/// filter to each pass as it arrives.
pub struct CandidateEnumerator<'a> {
    backend: &'a dyn Backend,
    filter: &'a ExclusionFilter,
    exhaustive: bool,
}

impl<'a> CandidateEnumerator<'a> {
    pub fn new(backend: &'a dyn Backend, filter: &'a ExclusionFilter) -> Self {
        Self {
            backend,
            filter,
            exhaustive: false,
        }
    }

    /// Always run the fallback pass after the instant one.
    pub fn exhaustive(mut self, exhaustive: bool) -> Self {
        self.exhaustive = exhaustive;
        self
    }

    fn pass(
        &self,
        graph: &OperatorGraph,
        mode: HeuristicMode,
        out: &mut Candidates,
    ) -> Result<()> {
        let configs = match self.backend.query_engines(graph, mode) {
            Ok(configs) => configs,
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => {
                warn!(?mode, "heuristic query failed, treating as empty: {e}");
                Vec::new()
            }
        };
        let before = configs.len();
        let kept = self.filter.filter(graph.class(), configs);
        out.excluded += before - kept.len();
        debug!(?mode, returned = before, kept = kept.len(), "heuristic pass");
        out.configs.extend(kept);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(class = %graph.class(), label = graph.label()))]
    pub fn enumerate(&self, graph: &OperatorGraph) -> Result<Candidates> {
        let mut out = Candidates::default();
        self.pass(graph, HeuristicMode::Instant, &mut out)?;
        if out.is_empty() || self.exhaustive {
            out.used_fallback = true;
            self.pass(graph, HeuristicMode::Fallback, &mut out)?;
        }
        Ok(out)
    }
}
