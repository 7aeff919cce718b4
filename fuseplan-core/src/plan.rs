use std::{collections::HashSet, sync::Arc};

use rayon::prelude::*;
use tracing::{debug, error, warn};

use crate::{
    backend::{Backend, CompiledPlan},
    engine::EngineConfig,
    graph::OperatorGraph,
    AlgorithmDescriptor, Error, Result,
};

/// A compiled plan bound to the graph and engine config it was built from.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    artifact: Arc<dyn CompiledPlan>,
    descriptor: AlgorithmDescriptor,
    graph_id: u64,
}

impl ExecutionPlan {
    pub fn tag(&self) -> &str {
        self.artifact.tag()
    }

    pub fn workspace_size(&self) -> u64 {
        self.artifact.workspace_size()
    }

    /// The serializable identity of this plan, including its workspace size.
    pub fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    pub fn is_for(&self, graph: &OperatorGraph) -> bool {
        self.graph_id == graph.graph_id()
    }

    pub fn artifact(&self) -> &dyn CompiledPlan {
        self.artifact.as_ref()
    }
}

/// Compiles ranked candidates into plans.
pub struct PlanBuilder<'a> {
    backend: &'a dyn Backend,
    workspace_limit: Option<u64>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            workspace_limit: None,
        }
    }

    /// Plans needing more scratch than `limit` bytes count as build failures.
    pub fn with_workspace_limit(mut self, limit: Option<u64>) -> Self {
        self.workspace_limit = limit;
        self
    }

    fn build_one(&self, graph: &OperatorGraph, config: &EngineConfig) -> Result<ExecutionPlan> {
        if !config.is_for(graph) {
            crate::structural!(
                "engine config {config} was enumerated for a different graph than `{}`",
                graph.label()
            );
        }
        let artifact = self.backend.compile(graph, config)?;
        let workspace = artifact.workspace_size();
        if let Some(limit) = self.workspace_limit {
            if workspace > limit {
                return Err(Error::BuildFailure {
                    engine_id: config.engine_id,
                    reason: format!("workspace of {workspace} bytes exceeds the {limit} byte limit"),
                }
                .bt());
            }
        }
        Ok(ExecutionPlan {
            artifact: Arc::from(artifact),
            descriptor: AlgorithmDescriptor {
                engine_id: config.engine_id,
                knobs: config.knobs.clone(),
                workspace_size: Some(workspace),
            },
            graph_id: graph.graph_id(),
        })
    }

    fn no_viable_plan(fingerprint: &str, candidates: usize, last_failure: Option<String>) -> Error {
        error!(fingerprint, candidates, ?last_failure, "no viable plan");
        Error::NoViablePlan {
            fingerprint: fingerprint.to_string(),
            candidates,
            last_failure,
        }
        .bt()
    }

    /// Compile candidates in ranked order and return the first plan that
    /// builds. Failing candidates are logged and skipped; structural errors
    /// abort immediately.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn build_first(
        &self,
        graph: &OperatorGraph,
        candidates: &[EngineConfig],
        fingerprint: &str,
    ) -> Result<ExecutionPlan> {
        let mut plans = self.build(graph, candidates, fingerprint, true)?;
        match plans.pop() {
            Some(plan) => Ok(plan),
            None => Err(Self::no_viable_plan(fingerprint, candidates.len(), None)),
        }
    }

    /// Compile candidates in ranked order, skipping configs already accepted.
    /// With `stop_at_first` the result holds exactly one plan.
    pub fn build(
        &self,
        graph: &OperatorGraph,
        candidates: &[EngineConfig],
        fingerprint: &str,
        stop_at_first: bool,
    ) -> Result<Vec<ExecutionPlan>> {
        let mut seen: HashSet<AlgorithmDescriptor> = HashSet::new();
        let mut plans = Vec::new();
        let mut last_failure = None;

        for config in candidates {
            let key = AlgorithmDescriptor::new(config.engine_id, config.knobs.clone());
            if seen.contains(&key) {
                debug!(%config, "skipping duplicate candidate");
                continue;
            }
            match self.build_one(graph, config) {
                Ok(plan) => {
                    debug!(%config, tag = plan.tag(), workspace = plan.workspace_size(), "built plan");
                    seen.insert(key);
                    plans.push(plan);
                    if stop_at_first {
                        break;
                    }
                }
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    warn!(%config, "candidate failed to build: {e}");
                    last_failure = Some(e.inner().to_string());
                }
            }
        }

        if plans.is_empty() {
            return Err(Self::no_viable_plan(
                fingerprint,
                candidates.len(),
                last_failure,
            ));
        }
        Ok(plans)
    }

    /// Compile every distinct candidate in parallel. Ranking order is
    /// preserved in the result.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn build_all(
        &self,
        graph: &OperatorGraph,
        candidates: &[EngineConfig],
        fingerprint: &str,
    ) -> Result<Vec<ExecutionPlan>> {
        let mut seen = HashSet::new();
        let distinct: Vec<&EngineConfig> = candidates
            .iter()
            .filter(|c| seen.insert(AlgorithmDescriptor::new(c.engine_id, c.knobs.clone())))
            .collect();

        let results: Vec<Result<ExecutionPlan>> = distinct
            .par_iter()
            .map(|config| self.build_one(graph, config))
            .collect();

        let mut plans = Vec::with_capacity(results.len());
        let mut last_failure = None;
        for (config, result) in distinct.iter().zip(results) {
            match result {
                Ok(plan) => plans.push(plan),
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    warn!(%config, "candidate failed to build: {e}");
                    last_failure = Some(e.inner().to_string());
                }
            }
        }
        if plans.is_empty() {
            return Err(Self::no_viable_plan(
                fingerprint,
                candidates.len(),
                last_failure,
            ));
        }
        debug!(built = plans.len(), "built all candidates");
        Ok(plans)
    }

    /// Rebuild a plan from a stored descriptor without consulting heuristics.
    /// A stored workspace size that no longer matches is rejected.
    #[tracing::instrument(skip_all, fields(%descriptor))]
    pub fn rebuild(
        &self,
        graph: &OperatorGraph,
        descriptor: &AlgorithmDescriptor,
    ) -> Result<ExecutionPlan> {
        let config = EngineConfig::from_descriptor(graph, descriptor);
        let plan = self.build_one(graph, &config)?;
        if let Some(stored) = descriptor.workspace_size {
            if stored != plan.workspace_size() {
                return Err(Error::BuildFailure {
                    engine_id: descriptor.engine_id,
                    reason: format!(
                        "replayed plan needs {} bytes of workspace, descriptor recorded {stored}",
                        plan.workspace_size()
                    ),
                }
                .bt());
            }
        }
        Ok(plan)
    }
}
