//! Error types for graph operations
//!
//! Every variant is a build-time failure: the scheduler never starts a step
//! when graph construction fails.

use super::StepId;
use thiserror::Error;

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur while building or validating the step graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency edges form a cycle
    #[error("Cycle detected in step dependency graph: {path}")]
    CycleDetected {
        /// The cycle, rendered as `a -> b -> a`
        path: String,
    },

    /// A step was not found in the graph
    #[error("Step not found: {step_id}")]
    StepNotFound { step_id: StepId },

    /// A `depends_on` entry names a step that was never declared
    #[error("Dependency '{dependency}' for step '{step}' does not exist")]
    DependencyNotFound { step: StepId, dependency: StepId },

    /// Two steps share an id
    #[error("Duplicate step ID: {step_id}")]
    DuplicateStep { step_id: StepId },

    /// A step lists itself in `depends_on`
    #[error("Step '{step_id}' cannot depend on itself")]
    SelfDependency { step_id: StepId },

    /// Inputs to graph evaluation are inconsistent with the graph
    #[error("Graph validation failed: {reason}")]
    ValidationFailed { reason: String },
}

impl GraphError {
    pub fn cycle(path: impl Into<String>) -> Self {
        Self::CycleDetected { path: path.into() }
    }

    pub fn step_not_found(step_id: StepId) -> Self {
        Self::StepNotFound { step_id }
    }

    pub fn dependency_not_found(step: StepId, dependency: StepId) -> Self {
        Self::DependencyNotFound { step, dependency }
    }

    pub fn duplicate_step(step_id: StepId) -> Self {
        Self::DuplicateStep { step_id }
    }

    pub fn self_dependency(step_id: StepId) -> Self {
        Self::SelfDependency { step_id }
    }

    pub fn validation_failed(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}
