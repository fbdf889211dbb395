//! Executable steps and the dependency graph built from them.

use super::error::StepError;
use super::job_state::JobState;
use crate::core::{StepGraphObjectMetadata, StepMetadata};
use crate::graph::{GraphResult, StepGraph, StepId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

pub type StepHandler =
    Arc<dyn Fn(StepExecutionContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// What a handler receives when its step runs.
#[derive(Debug, Clone)]
pub struct StepExecutionContext {
    pub step_id: String,
    pub step_name: String,
    pub job_state: JobState,
    /// The step's tracing span. Enter it in tasks the handler spawns.
    pub span: tracing::Span,
}

/// Step metadata plus the handler that runs it.
///
/// ```
/// use integrator::executor::Step;
///
/// let step = Step::new("fetch-groups", "Fetch Groups")
///     .entity_type("acme_group")
///     .relationship_type("acme_group_has_user")
///     .depends_on("fetch-users")
///     .handler(|ctx| async move {
///         ctx.job_state.get_entity("acme-account").await?;
///         Ok(())
///     });
///
/// assert_eq!(step.metadata().depends_on, vec!["fetch-users"]);
/// assert_eq!(step.metadata().declared_types(), vec!["acme_group", "acme_group_has_user"]);
/// ```
#[derive(Clone)]
pub struct Step {
    metadata: StepMetadata,
    handler: StepHandler,
}

impl Step {
    /// Creates a step whose handler does nothing.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: StepMetadata::new(id, name),
            handler: Arc::new(|_ctx: StepExecutionContext| async { Ok::<(), StepError>(()) }.boxed()),
        }
    }

    pub fn from_metadata(metadata: StepMetadata) -> Self {
        Self {
            metadata,
            ..Self::new("", "")
        }
    }

    pub fn entity_type(mut self, object_type: impl Into<String>) -> Self {
        self.metadata
            .entities
            .push(StepGraphObjectMetadata::new(object_type));
        self
    }

    /// Declares a type this step may only partially ingest.
    pub fn partial_entity_type(mut self, object_type: impl Into<String>) -> Self {
        self.metadata
            .entities
            .push(StepGraphObjectMetadata::new(object_type).partial());
        self
    }

    pub fn relationship_type(mut self, object_type: impl Into<String>) -> Self {
        self.metadata
            .relationships
            .push(StepGraphObjectMetadata::new(object_type));
        self
    }

    pub fn mapped_relationship_type(mut self, object_type: impl Into<String>) -> Self {
        self.metadata
            .mapped_relationships
            .push(StepGraphObjectMetadata::new(object_type));
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.metadata.depends_on.push(step_id.into());
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(StepExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.handler = Arc::new(move |ctx: StepExecutionContext| handler(ctx).boxed());
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub(crate) fn run(&self, ctx: StepExecutionContext) -> BoxFuture<'static, Result<(), StepError>> {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Validated steps with their dependency graph.
///
/// Graph nodes are inserted in step order, so a step's position in
/// [`StepGraph`] is its index in [`StepDependencyGraph::steps`].
#[derive(Debug, Clone)]
pub struct StepDependencyGraph {
    graph: StepGraph,
    steps: Vec<Step>,
}

impl StepDependencyGraph {
    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.graph
            .position(&StepId::new(id))
            .map(|position| &self.steps[position])
    }

    pub fn metadata(&self) -> Vec<StepMetadata> {
        self.steps.iter().map(|s| s.metadata.clone()).collect()
    }

    pub fn to_dot(&self) -> String {
        self.graph.to_dot()
    }
}

/// Builds and validates the dependency graph for `steps`.
///
/// Fails on duplicate step ids, self-dependencies, unknown dependencies and
/// cycles.
pub fn build_step_dependency_graph(steps: Vec<Step>) -> GraphResult<StepDependencyGraph> {
    let metadata: Vec<StepMetadata> = steps.iter().map(|s| s.metadata.clone()).collect();
    let graph = StepGraph::from_steps(&metadata)?;
    Ok(StepDependencyGraph { graph, steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphError;

    #[test]
    fn test_build_graph_keeps_step_order() {
        let graph = build_step_dependency_graph(vec![
            Step::new("c", "C").depends_on("b"),
            Step::new("a", "A"),
            Step::new("b", "B").depends_on("a"),
        ])
        .unwrap();

        let ids: Vec<&str> = graph.steps().iter().map(Step::id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(graph.step("b").map(Step::id), Some("b"));
        assert!(graph.step("missing").is_none());
        assert_eq!(graph.graph().topological_sort().unwrap(), vec![
            StepId::new("a"),
            StepId::new("b"),
            StepId::new("c")
        ]);
    }

    #[test]
    fn test_build_graph_rejects_unknown_dependency() {
        let error = build_step_dependency_graph(vec![Step::new("a", "A").depends_on("ghost")])
            .unwrap_err();
        assert!(matches!(error, GraphError::DependencyNotFound { .. }));
    }

    #[test]
    fn test_build_graph_rejects_cycle() {
        let error = build_step_dependency_graph(vec![
            Step::new("a", "A").depends_on("b"),
            Step::new("b", "B").depends_on("a"),
        ])
        .unwrap_err();
        assert!(matches!(error, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn test_declared_types() {
        let step = Step::new("s", "S")
            .entity_type("acme_user")
            .partial_entity_type("acme_device")
            .mapped_relationship_type("acme_user_owns_device");

        assert_eq!(step.metadata().partial_types(), vec!["acme_device"]);
        assert_eq!(step.metadata().declared_types().len(), 3);
    }
}
