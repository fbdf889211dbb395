//! Step dependency graph
//!
//! Converts a list of steps with `depends_on` edges into a DAG, rejecting
//! duplicate ids, dangling dependencies and cycles before any step runs.
//!
//! - [`StepGraph`]: topology, topological sort, cycle paths, DOT export
//! - [`initial_step_results`]: the starting status of every step
//!
//! # Design Principles
//!
//! The module hides the graph representation and exposes only abstract
//! operations: add_step, add_dependency, dependencies_of, dependents_of.
//! Execution state lives in the scheduler, never in the graph.

mod error;
mod initial;
mod step_graph;
mod step_id;

pub use error::{GraphError, GraphResult};
pub use initial::initial_step_results;
pub use step_graph::{StepGraph, StepNode};
pub use step_id::StepId;
