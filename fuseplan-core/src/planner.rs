//! Request → graph → cached plan → [`Runner`].

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    algorithm::AlgorithmStore,
    autotune::Autotuner,
    backend::{Backend, ContextId, ScratchAllocator, Stream},
    cache::{CacheEntry, PlanCache},
    config::BuildOptions,
    errata::ExclusionFilter,
    fingerprint::{computation_fingerprint, default_arguments, KernelArgument},
    graph::{DeclaredInputs, FusionPattern, OperatorGraph},
    heuristics::CandidateEnumerator,
    plan::{ExecutionPlan, PlanBuilder},
    runner::Runner,
    AlgorithmDescriptor, Result,
};

/// What to fuse: a fixed pattern or a declarative op sequence.
#[derive(Debug, Clone)]
pub enum FusionRequest {
    Pattern(FusionPattern),
    Declarative { text: String, inputs: DeclaredInputs },
}

impl FusionRequest {
    pub fn to_graph(&self) -> Result<OperatorGraph> {
        match self {
            Self::Pattern(pattern) => pattern.build(),
            Self::Declarative { text, inputs } => OperatorGraph::from_op_sequence(text, inputs),
        }
    }
}

impl From<FusionPattern> for FusionRequest {
    fn from(pattern: FusionPattern) -> Self {
        Self::Pattern(pattern)
    }
}

/// Owns the exclusion policy, the optional algorithm store and one plan
/// cache per device context.
pub struct Planner {
    backend: Arc<dyn Backend>,
    options: BuildOptions,
    filter: ExclusionFilter,
    store: Option<AlgorithmStore>,
    caches: Mutex<HashMap<ContextId, Arc<PlanCache>>>,
}

impl Planner {
    pub fn new(backend: Arc<dyn Backend>, options: BuildOptions) -> Result<Self> {
        let filter = ExclusionFilter::new(&options, backend.device())?;
        let store = options.algorithm_store.clone().map(AlgorithmStore::new);
        Ok(Self {
            backend,
            options,
            filter,
            store,
            caches: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_filter(mut self, filter: ExclusionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_store(mut self, store: AlgorithmStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn filter(&self) -> &ExclusionFilter {
        &self.filter
    }

    pub fn store(&self) -> Option<&AlgorithmStore> {
        self.store.as_ref()
    }

    /// The plan cache of `context`, created on first use.
    pub fn cache(&self, context: ContextId) -> Arc<PlanCache> {
        self.caches.lock().entry(context).or_default().clone()
    }

    fn builder(&self) -> PlanBuilder<'_> {
        PlanBuilder::new(self.backend.as_ref()).with_workspace_limit(self.options.workspace_limit)
    }

    /// Cache key for `graph` launched with `args`. The discriminator names
    /// the backend and its engine library version.
    pub fn fingerprint(&self, graph: &OperatorGraph, args: &[KernelArgument]) -> String {
        let discriminator = format!(
            "{}@{}",
            self.backend.name(),
            self.backend.device().backend_version
        );
        computation_fingerprint(graph, args, &discriminator)
    }

    /// Replay a stored descriptor, or enumerate, filter and build.
    fn select(
        &self,
        graph: &OperatorGraph,
        fingerprint: &str,
        stream: &dyn Stream,
        scratch: &dyn ScratchAllocator,
    ) -> Result<ExecutionPlan> {
        let builder = self.builder();

        // Stored descriptors carry no numeric notes, so they cannot be
        // checked against a determinism requirement.
        if let (Some(store), false) = (&self.store, self.options.require_determinism) {
            if let Some(descriptor) = store.lookup(fingerprint) {
                match builder.rebuild(graph, &descriptor) {
                    Ok(plan) => {
                        debug!(%descriptor, "replayed stored algorithm");
                        return Ok(plan);
                    }
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => warn!(%descriptor, "stored algorithm no longer builds: {e}"),
                }
            }
        }

        let candidates = CandidateEnumerator::new(self.backend.as_ref(), &self.filter)
            .exhaustive(self.options.exhaustive_search)
            .enumerate(graph)?;
        debug!(
            candidates = candidates.len(),
            excluded = candidates.excluded,
            fallback = candidates.used_fallback,
            "enumerated candidates"
        );

        if self.options.wants_autotune() {
            let tuned = Autotuner::new(builder, self.store.as_ref()).tune(
                graph,
                &candidates.configs,
                fingerprint,
                stream,
                scratch,
            )?;
            Ok(tuned.best)
        } else {
            builder.build_first(graph, &candidates.configs, fingerprint)
        }
    }

    /// The cached plan for `graph` on the stream's context, building it on
    /// a miss. The flag is `true` on a cache hit.
    #[tracing::instrument(skip_all, fields(label = graph.label()))]
    pub fn plan(
        &self,
        graph: &OperatorGraph,
        args: &[KernelArgument],
        stream: &dyn Stream,
        scratch: &dyn ScratchAllocator,
    ) -> Result<(Arc<CacheEntry>, bool)> {
        let fingerprint = self.fingerprint(graph, args);
        debug!(%fingerprint, "fingerprinted graph");
        let cache = self.cache(stream.context());
        let (entry, hit) =
            cache.get_or_build(&fingerprint, || self.select(graph, &fingerprint, stream, scratch));
        Ok((entry?, hit))
    }

    /// Build (or reuse) a plan for `request` with every materialized tensor
    /// in its own buffer, bound to the stream's context.
    pub fn prepare(
        &self,
        request: &FusionRequest,
        stream: &dyn Stream,
        scratch: &dyn ScratchAllocator,
    ) -> Result<Runner> {
        let graph = request.to_graph()?;
        let args = default_arguments(&graph);
        self.prepare_graph(&graph, &args, stream, scratch)
    }

    pub fn prepare_graph(
        &self,
        graph: &OperatorGraph,
        args: &[KernelArgument],
        stream: &dyn Stream,
        scratch: &dyn ScratchAllocator,
    ) -> Result<Runner> {
        let (entry, _) = self.plan(graph, args, stream, scratch)?;
        Runner::new(entry.plan.clone(), graph, stream.context())
    }

    /// Rebuild `descriptor` for `request` without heuristics or caching.
    pub fn replay(
        &self,
        request: &FusionRequest,
        descriptor: &AlgorithmDescriptor,
        context: ContextId,
    ) -> Result<Runner> {
        let graph = request.to_graph()?;
        let plan = self.builder().rebuild(&graph, descriptor)?;
        Runner::new(plan, &graph, context)
    }
}
