use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{plan::ExecutionPlan, Result};

/// A successfully built plan stored under its fingerprint.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub plan: ExecutionPlan,
    /// Unique for the lifetime of the cache.
    pub name: String,
}

/// Fingerprint-keyed memo of the graph → plan pipeline.
///
/// One mutex guards the whole map and the generator runs while it is held,
/// so a fingerprint is never built twice, at the cost of serializing cold
/// builds of unrelated fingerprints. Failures are returned but not stored.
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct PlanCache {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `fingerprint`, running `generator` on a miss. The flag is
    /// `true` when the entry was already present.
    #[tracing::instrument(skip_all, fields(%fingerprint))]
    pub fn get_or_build<F>(&self, fingerprint: &str, generator: F) -> (Result<Arc<CacheEntry>>, bool)
    where
        F: FnOnce() -> Result<ExecutionPlan>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(fingerprint) {
            return (Ok(entry.clone()), true);
        }

        let plan = match generator() {
            Ok(plan) => plan,
            Err(e) => return (Err(e), false),
        };
        let entry = Arc::new(CacheEntry {
            fingerprint: fingerprint.to_string(),
            name: format!("fused_plan_{}", entries.len()),
            plan,
        });
        debug!(name = entry.name, tag = entry.plan.tag(), "cached plan");
        entries.insert(fingerprint.to_string(), entry.clone());
        (Ok(entry), false)
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
