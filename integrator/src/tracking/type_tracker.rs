//! Per-step `_type` counters.
//!
//! Purely additive: counts only grow. The scheduler reads them after a step
//! finishes to fill `encountered_types` and to warn about undeclared types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSummary {
    pub total: u64,
}

#[derive(Debug, Default)]
pub struct TypeTracker {
    // step id -> _type -> count
    counts: RwLock<HashMap<String, BTreeMap<String, u64>>>,
}

impl TypeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step_graph_object_type(&self, step_id: &str, object_type: &str, count: u64) {
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        *counts
            .entry(step_id.to_string())
            .or_default()
            .entry(object_type.to_string())
            .or_insert(0) += count;
    }

    /// Types written by one step, sorted.
    pub fn encountered_types_for_step(&self, step_id: &str) -> Vec<String> {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_id)
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Types written by any step, sorted and deduplicated.
    pub fn all_encountered_types(&self) -> Vec<String> {
        let counts = self.counts.read().unwrap_or_else(PoisonError::into_inner);
        counts
            .values()
            .flat_map(|types| types.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn summarize_step(&self, step_id: &str) -> BTreeMap<String, TypeSummary> {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_id)
            .map(|types| {
                types
                    .iter()
                    .map(|(object_type, &total)| (object_type.clone(), TypeSummary { total }))
                    .collect()
            })
            .unwrap_or_default()
    }
}
