//! Profile every viable plan for a graph and keep the fastest.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    algorithm::AlgorithmStore,
    backend::{DevicePtr, ScratchAllocator, Stream},
    engine::EngineConfig,
    graph::OperatorGraph,
    plan::{ExecutionPlan, PlanBuilder},
    runner::{ProfileResult, Runner},
    Error, Result,
};

/// Timed runs per plan; the minimum counts.
pub const DEFAULT_ITERATIONS: usize = 3;

#[derive(Debug, Clone)]
pub struct AutotuneResult {
    pub best: ExecutionPlan,
    /// One entry per plan that ran, in ranking order.
    pub profiles: Vec<ProfileResult>,
}

pub struct Autotuner<'a> {
    builder: PlanBuilder<'a>,
    store: Option<&'a AlgorithmStore>,
    iterations: usize,
}

impl<'a> Autotuner<'a> {
    pub fn new(builder: PlanBuilder<'a>, store: Option<&'a AlgorithmStore>) -> Self {
        Self {
            builder,
            store,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    fn profile(
        &self,
        runner: &mut Runner,
        stream: &dyn Stream,
        buffers: &[DevicePtr],
        scratch: &dyn ScratchAllocator,
    ) -> Result<ProfileResult> {
        let mut best: Option<ProfileResult> = None;
        for _ in 0..self.iterations {
            let Some(result) = runner.run_profiled(stream, buffers, scratch, true)? else {
                return Err(Error::execution("profiled run reported no timing"));
            };
            if best.as_ref().map_or(true, |b| result.elapsed < b.elapsed) {
                best = Some(result);
            }
        }
        best.ok_or_else(|| Error::execution("no profiled runs"))
    }

    /// Build every distinct candidate, time each on `stream` with scratch
    /// buffers from `scratch`, and return the fastest. Ties keep ranking
    /// order. The winner is recorded in the algorithm store when one is set.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn tune(
        &self,
        graph: &OperatorGraph,
        candidates: &[EngineConfig],
        fingerprint: &str,
        stream: &dyn Stream,
        scratch: &dyn ScratchAllocator,
    ) -> Result<AutotuneResult> {
        let plans = self.builder.build_all(graph, candidates, fingerprint)?;

        let buffers = graph
            .materialized()
            .iter()
            .map(|t| scratch.allocate(t.desc.size_in_bytes().max(1)))
            .collect::<Result<Vec<_>>>()?;

        let mut best: Option<(Duration, ExecutionPlan)> = None;
        let mut profiles = Vec::with_capacity(plans.len());
        let mut last_failure = None;
        for plan in plans {
            let mut runner = Runner::new(plan.clone(), graph, stream.context())?;
            runner.bind_placeholder_scalars();
            match self.profile(&mut runner, stream, &buffers, scratch) {
                Ok(result) => {
                    debug!(algorithm = %result.algorithm, elapsed = ?result.elapsed, "profiled plan");
                    if best.as_ref().map_or(true, |(t, _)| result.elapsed < *t) {
                        best = Some((result.elapsed, plan));
                    }
                    profiles.push(result);
                }
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    warn!(tag = plan.tag(), "plan failed while profiling: {e}");
                    last_failure = Some(e.inner().to_string());
                }
            }
        }

        let Some((elapsed, best)) = best else {
            return Err(Error::NoViablePlan {
                fingerprint: fingerprint.to_string(),
                candidates: candidates.len(),
                last_failure,
            }
            .bt());
        };
        info!(algorithm = %best.descriptor(), ?elapsed, profiled = profiles.len(), "autotuned");

        if let Some(store) = self.store {
            if let Err(e) = store.record(fingerprint, best.descriptor(), elapsed.as_secs_f64()) {
                warn!(path = %store.path().display(), "failed to persist autotuned algorithm: {e}");
            }
        }
        Ok(AutotuneResult { best, profiles })
    }
}
