//! Step execution: scheduling, the per-step job state, and uploads.
//!
//! This module hides:
//! - Dependency-ordered scheduling of steps with bounded concurrency
//! - How graph object writes are validated, tracked and buffered
//! - How flushed data reaches the remote sink and how failures are charged
//!   back to the step that produced them
//!
//! # Pieces
//!
//! - [`Step`] / [`build_step_dependency_graph`]: steps and their validated graph
//! - [`StepGraphExecutor`] / [`execute_step_dependency_graph`]: the scheduler
//! - [`JobState`]: what a handler reads from and writes to
//! - [`UploadQueue`] / [`GraphObjectSink`]: per-step bounded uploads
//! - [`ExecutionSummary`]: the run's `summary.json`

mod config;
mod dependency;
mod error;
mod interceptor;
mod job_state;
mod step;
mod summary;
mod upload;

pub use config::{ExecutorConfig, DEFAULT_UPLOAD_CONCURRENCY};
pub use dependency::{execute_step_dependency_graph, StepGraphExecutor};
pub use error::{
    BoxError, ErrorKind, ExecutionError, Result, SinkError, StepError, UploadError,
    UploadQueueError,
};
pub use interceptor::{EntityInterceptor, ExecutionHooks, RelationshipInterceptor};
pub use job_state::JobState;
pub use step::{
    build_step_dependency_graph, Step, StepDependencyGraph, StepExecutionContext, StepHandler,
};
pub use summary::{ExecutionSummary, PartialDatasets, SummaryMetadata};
pub use upload::{GraphObjectSink, RetryingSink, UploadQueue};
