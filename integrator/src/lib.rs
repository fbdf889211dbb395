//! Integrator: step dependency scheduler and graph-object pipeline
//!
//! An integration run is a set of steps. Each step fetches data from a
//! provider and turns it into graph objects (entities and relationships)
//! with run-unique `_key`s. Steps declare which other steps they depend on;
//! the runtime executes them in dependency order, as concurrently as the
//! graph allows, and streams their output through a bounded in-memory
//! buffer to durable storage and on to a remote sink.
//!
//! # Quick Start
//!
//! ```
//! use integrator::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = build_step_dependency_graph(vec![
//!     Step::new("fetch-users", "Fetch Users")
//!         .entity_type("acme_user")
//!         .handler(|ctx| async move {
//!             ctx.job_state
//!                 .add_entity(Entity::new("acme-user-1", "acme_user", "User"))
//!                 .await?;
//!             Ok(())
//!         }),
//!     Step::new("fetch-groups", "Fetch Groups")
//!         .entity_type("acme_group")
//!         .depends_on("fetch-users")
//!         .handler(|ctx| async move {
//!             let user = ctx.job_state.get_entity("acme-user-1").await?;
//!             ctx.job_state
//!                 .add_entity(Entity::new(format!("{}-group", user.key), "acme_group", "Group"))
//!                 .await?;
//!             Ok(())
//!         }),
//! ])?;
//!
//! let store = Arc::new(InMemoryGraphObjectStore::new());
//! let results = execute_step_dependency_graph(graph, StepStartStates::new(), store).await?;
//!
//! let summary = ExecutionSummary::from_results(results);
//! assert!(summary.partial_types().is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! Each module hides a design decision that is likely to change:
//!
//! - [`core`]: graph objects, step metadata and results, retry policy (hides the wire format)
//! - [`graph`]: the step dependency DAG (hides the graph representation)
//! - [`tracking`]: run-wide key and type registries (hides sharding of large key spaces)
//! - [`storage`]: graph object stores and blob storage (hides buffering and file layout)
//! - [`executor`]: scheduling, job state and uploads (hides the concurrency strategy)

pub mod core;
pub mod executor;
pub mod graph;
pub mod storage;
pub mod tracking;

pub use core::{
    CoreError, Entity, GraphObjectFilter, Relationship, Result as CoreResult, RetryPolicy,
    StepMetadata, StepResult, StepResultStatus, StepStartState, StepStartStates,
};

pub use executor::{
    build_step_dependency_graph, execute_step_dependency_graph, ExecutionError,
    ExecutionSummary, ExecutorConfig, GraphObjectSink, JobState, Result as ExecutionResult,
    Step, StepDependencyGraph, StepError, StepExecutionContext, StepGraphExecutor,
};

pub use graph::{GraphError, GraphResult, StepGraph, StepId};

pub use storage::{
    BlobStore, FileBlobStore, FileSystemGraphObjectStore, GraphObjectStore,
    InMemoryGraphObjectStore, Result as StorageResult, StorageError,
};

pub use tracking::{DuplicateKeyTracker, TypeTracker};

// Handlers and sinks name these in their signatures.
pub use async_trait::async_trait;
pub use serde_json;
pub use tokio;

/// Prelude module for convenient glob imports
///
/// ```
/// use integrator::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        Entity, FlushedGraphObjectData, GraphObjectFilter, Relationship, RetryPolicy,
        StepResult, StepResultStatus, StepStartState, StepStartStates,
    };

    pub use crate::executor::{
        build_step_dependency_graph, execute_step_dependency_graph, ErrorKind, ExecutionError,
        ExecutionSummary, ExecutorConfig, GraphObjectSink, JobState, SinkError, Step,
        StepError, StepExecutionContext, StepGraphExecutor,
    };

    pub use crate::storage::{
        FileBlobStore, FileSystemGraphObjectStore, FileSystemStoreConfig, GraphObjectStore,
        InMemoryGraphObjectStore,
    };

    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
