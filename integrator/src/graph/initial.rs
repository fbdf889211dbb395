//! Initial step results derived from the graph and the start states.

use super::error::{GraphError, GraphResult};
use super::{StepGraph, StepId};
use crate::core::{StepMetadata, StepResult, StepResultStatus, StepStartStates};
use std::collections::HashSet;

/// Creates one result per step, in step order.
///
/// A step starts `DISABLED` when it, or any step it transitively depends on,
/// is disabled in `start_states`. Every other step starts
/// `PENDING_EVALUATION`. Steps missing from `start_states` count as enabled;
/// ids in `start_states` that name no step are rejected.
pub fn initial_step_results(
    graph: &StepGraph,
    steps: &[StepMetadata],
    start_states: &StepStartStates,
) -> GraphResult<Vec<StepResult>> {
    if let Some(unknown) = start_states
        .keys()
        .find(|id| !graph.contains_step(&StepId::new(id.as_str())))
    {
        return Err(GraphError::validation_failed(format!(
            "start state provided for unknown step '{}'",
            unknown
        )));
    }

    let mut disabled: HashSet<StepId> = HashSet::new();
    for id in graph.step_ids() {
        let disabled_at_start = start_states
            .get(id.as_str())
            .is_some_and(|state| state.disabled);
        if disabled_at_start && !disabled.contains(id) {
            disabled.insert(id.clone());
            disabled.extend(graph.transitive_dependents(id));
        }
    }

    steps
        .iter()
        .map(|step| {
            let id = StepId::new(&step.id);
            if !graph.contains_step(&id) {
                return Err(GraphError::step_not_found(id));
            }
            let status = if disabled.contains(&id) {
                StepResultStatus::Disabled
            } else {
                StepResultStatus::PendingEvaluation
            };
            Ok(StepResult::initial(step, status))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepStartState;

    fn step(id: &str, depends_on: &[&str]) -> StepMetadata {
        StepMetadata {
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            ..StepMetadata::new(id, id)
        }
    }

    fn statuses(results: &[StepResult]) -> Vec<(&str, StepResultStatus)> {
        results
            .iter()
            .map(|r| (r.id.as_str(), r.status))
            .collect()
    }

    #[test]
    fn test_all_enabled_by_default() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let graph = StepGraph::from_steps(&steps).unwrap();

        let results = initial_step_results(&graph, &steps, &StepStartStates::new()).unwrap();

        assert_eq!(
            statuses(&results),
            vec![
                ("a", StepResultStatus::PendingEvaluation),
                ("b", StepResultStatus::PendingEvaluation),
            ]
        );
    }

    #[test]
    fn test_disabled_propagates_to_transitive_dependents() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ];
        let graph = StepGraph::from_steps(&steps).unwrap();
        let start_states = StepStartStates::from([("a".to_string(), StepStartState::disabled())]);

        let results = initial_step_results(&graph, &steps, &start_states).unwrap();

        assert_eq!(
            statuses(&results),
            vec![
                ("a", StepResultStatus::Disabled),
                ("b", StepResultStatus::Disabled),
                ("c", StepResultStatus::Disabled),
                ("d", StepResultStatus::PendingEvaluation),
            ]
        );
    }

    #[test]
    fn test_unknown_start_state_is_rejected() {
        let steps = vec![step("a", &[])];
        let graph = StepGraph::from_steps(&steps).unwrap();
        let start_states = StepStartStates::from([("zzz".to_string(), StepStartState::enabled())]);

        let result = initial_step_results(&graph, &steps, &start_states);
        assert!(matches!(result, Err(GraphError::ValidationFailed { .. })));
    }
}
