//! Storage layer for graph objects produced by steps.
//!
//! - [`GraphObjectStore`]: the trait every store implements
//! - [`InMemoryGraphObjectStore`]: everything stays in memory
//! - [`FileSystemGraphObjectStore`]: buffers in memory, flushes to a [`BlobStore`]
//! - [`BlobStore`]: durable path-addressed storage ([`FileBlobStore`], [`MemoryBlobStore`])
//! - [`DataStore`]: arbitrary per-run values steps share through `get_data`/`set_data`
//!
//! # Example
//!
//! ```
//! use integrator::core::{Entity, GraphObjectFilter};
//! use integrator::storage::{GraphObjectStore, InMemoryGraphObjectStore};
//! use futures::TryStreamExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryGraphObjectStore::new();
//! GraphObjectStore::add_entities(&store, "fetch-users", vec![Entity::new("u1", "acme_user", "User")], None)
//!     .await?;
//!
//! let users: Vec<_> = GraphObjectStore::iterate_entities(&store, &GraphObjectFilter::of_type("acme_user"))
//!     .await?
//!     .try_collect()
//!     .await?;
//! assert_eq!(users.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

pub mod blob;
mod data_store;
mod error;
mod file_system;
mod memory;

pub use blob::{BlobStore, Collection, FileBlobStore, MemoryBlobStore, SUMMARY_FILE};
pub use data_store::DataStore;
pub use error::{Result, StorageError};
pub use file_system::{
    FileSystemGraphObjectStore, FileSystemStoreConfig, DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD,
    DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD_IN_BYTES, DEFAULT_GRAPH_OBJECT_FILE_SIZE,
};
pub use memory::InMemoryGraphObjectStore;

pub(crate) use file_system::read_step_graph_files;

use crate::core::{Entity, GraphObjectFilter, Relationship};

/// Receives exactly the objects a store flushed.
///
/// The upload queue implements this so that flushed data is forwarded to the
/// remote sink as soon as it leaves the buffer.
#[async_trait]
pub trait FlushListener: Send + Sync {
    async fn entities_flushed(&self, entities: Vec<Arc<Entity>>);

    async fn relationships_flushed(&self, relationships: Vec<Arc<Relationship>>);
}

/// Staging area for the graph objects of a run.
///
/// All methods are safe under interleaved calls from concurrently running
/// steps. Iteration streams are snapshots: objects added after the call
/// returns may or may not be seen, but none is seen twice.
#[async_trait]
pub trait GraphObjectStore: Send + Sync {
    /// Stores entities produced by `step_id`, flushing through `listener` if
    /// a buffer threshold is reached.
    async fn add_entities(
        &self,
        step_id: &str,
        entities: Vec<Entity>,
        listener: Option<&dyn FlushListener>,
    ) -> Result<()>;

    async fn add_relationships(
        &self,
        step_id: &str,
        relationships: Vec<Relationship>,
        listener: Option<&dyn FlushListener>,
    ) -> Result<()>;

    async fn find_entity(&self, key: &str) -> Result<Option<Arc<Entity>>>;

    async fn iterate_entities(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Entity>>>>;

    async fn iterate_relationships(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Relationship>>>>;

    /// Forces everything buffered out of memory.
    async fn flush(&self, listener: Option<&dyn FlushListener>) -> Result<()>;
}
