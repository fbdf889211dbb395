//! File-backed graph object store.
//!
//! Objects are buffered in an [`InMemoryGraphObjectStore`] and written to a
//! [`BlobStore`] once the buffer reaches its item-count or byte threshold,
//! or when a flush is forced at the end of a step.
//!
//! # Layout
//!
//! ```text
//! graph/{stepId}/entities/{uuid}.json        {"entities": [...]}
//! graph/{stepId}/relationships/{uuid}.json   {"relationships": [...]}
//! index/entities/{_type}/{uuid}.json         link to the graph file
//! index/relationships/{_type}/{uuid}.json    link to the graph file
//! ```
//!
//! Every graph file holds objects of one `_type` from one step, at most
//! `graph_object_file_size` of them.
//!
//! # Flush discipline
//!
//! Flushes of either collection hold one binary lock while they write files,
//! record on-disk locations and remove the objects from the buffer. Iteration
//! takes the same lock to snapshot the buffer and list the index, so an
//! object is seen either in memory or on disk, never both and never neither.
//! A step's data is therefore durable (or handed to its listener) before any
//! dependent step starts reading it.

use super::blob::{graph_dir, graph_file_path, index_dir, index_file_path, BlobStore, Collection};
use super::error::{Result, StorageError};
use super::{FlushListener, GraphObjectStore, InMemoryGraphObjectStore};
use crate::core::{
    deserialize_value, serialize_value, serialize_value_pretty, BigMap, Entity, GraphObject,
    GraphObjectFilter, Relationship, StepMetadata,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Buffered objects per collection before an automatic flush.
pub const DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD: usize = 500;

/// Buffered JSON bytes per collection before an automatic flush.
pub const DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD_IN_BYTES: usize = 5_000_000;

/// Objects per graph file.
pub const DEFAULT_GRAPH_OBJECT_FILE_SIZE: usize = 500;

const LOCATION_INDEX_SHARD_SIZE: usize = 10_000_000;

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileSystemStoreConfig {
    pub graph_object_buffer_threshold: usize,
    pub graph_object_buffer_threshold_in_bytes: usize,
    pub graph_object_file_size: usize,
    /// Indent graph files. Larger on disk, easier to inspect.
    pub pretty_files: bool,
}

impl Default for FileSystemStoreConfig {
    fn default() -> Self {
        Self {
            graph_object_buffer_threshold: DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD,
            graph_object_buffer_threshold_in_bytes: DEFAULT_GRAPH_OBJECT_BUFFER_THRESHOLD_IN_BYTES,
            graph_object_file_size: DEFAULT_GRAPH_OBJECT_FILE_SIZE,
            pretty_files: false,
        }
    }
}

impl FileSystemStoreConfig {
    pub fn with_buffer_threshold(mut self, items: usize) -> Self {
        self.graph_object_buffer_threshold = items;
        self
    }

    pub fn with_buffer_threshold_in_bytes(mut self, bytes: usize) -> Self {
        self.graph_object_buffer_threshold_in_bytes = bytes;
        self
    }

    pub fn with_file_size(mut self, objects_per_file: usize) -> Self {
        self.graph_object_file_size = objects_per_file;
        self
    }

    pub fn with_pretty_files(mut self, pretty: bool) -> Self {
        self.pretty_files = pretty;
        self
    }
}

// =============================================================================
// GRAPH FILES
// =============================================================================

#[derive(Serialize)]
struct EntitiesFileOut<'a> {
    entities: &'a [Arc<Entity>],
}

#[derive(Deserialize)]
struct EntitiesFileIn {
    entities: Vec<Entity>,
}

#[derive(Serialize)]
struct RelationshipsFileOut<'a> {
    relationships: &'a [Arc<Relationship>],
}

#[derive(Deserialize)]
struct RelationshipsFileIn {
    relationships: Vec<Relationship>,
}

/// What the store needs to know to flush one collection.
pub(crate) trait GraphFileObject: GraphObject + DeserializeOwned {
    const COLLECTION: Collection;

    /// (item count, byte size) currently buffered.
    fn buffered(buffer: &InMemoryGraphObjectStore) -> (usize, usize);
    fn of_type(buffer: &InMemoryGraphObjectStore, object_type: &str) -> Vec<Arc<Self>>;
    fn collect_by_step(buffer: &InMemoryGraphObjectStore) -> BTreeMap<String, Vec<Arc<Self>>>;
    fn remove_flushed(buffer: &InMemoryGraphObjectStore, objects: &[Arc<Self>]) -> Result<()>;
    fn encode_file(objects: &[Arc<Self>], pretty: bool) -> Result<Vec<u8>>;
    fn decode_file(bytes: &[u8]) -> Result<Vec<Self>>;
    fn notify<'a>(listener: &'a dyn FlushListener, objects: Vec<Arc<Self>>) -> BoxFuture<'a, ()>;
}

fn encode<T: Serialize>(body: &T, pretty: bool) -> Result<Vec<u8>> {
    let bytes = if pretty {
        serialize_value_pretty(body)?
    } else {
        serialize_value(body)?
    };
    Ok(bytes)
}

impl GraphFileObject for Entity {
    const COLLECTION: Collection = Collection::Entities;

    fn buffered(buffer: &InMemoryGraphObjectStore) -> (usize, usize) {
        (
            buffer.total_entity_item_count(),
            buffer.total_entity_byte_size(),
        )
    }

    fn of_type(buffer: &InMemoryGraphObjectStore, object_type: &str) -> Vec<Arc<Self>> {
        buffer.entities_of_type(object_type)
    }

    fn collect_by_step(buffer: &InMemoryGraphObjectStore) -> BTreeMap<String, Vec<Arc<Self>>> {
        buffer.collect_entities_by_step()
    }

    fn remove_flushed(buffer: &InMemoryGraphObjectStore, objects: &[Arc<Self>]) -> Result<()> {
        buffer.flush_entities(objects)
    }

    fn encode_file(objects: &[Arc<Self>], pretty: bool) -> Result<Vec<u8>> {
        encode(&EntitiesFileOut { entities: objects }, pretty)
    }

    fn decode_file(bytes: &[u8]) -> Result<Vec<Self>> {
        Ok(deserialize_value::<EntitiesFileIn>(bytes)?.entities)
    }

    fn notify<'a>(listener: &'a dyn FlushListener, objects: Vec<Arc<Self>>) -> BoxFuture<'a, ()> {
        listener.entities_flushed(objects)
    }
}

impl GraphFileObject for Relationship {
    const COLLECTION: Collection = Collection::Relationships;

    fn buffered(buffer: &InMemoryGraphObjectStore) -> (usize, usize) {
        (
            buffer.total_relationship_item_count(),
            buffer.total_relationship_byte_size(),
        )
    }

    fn of_type(buffer: &InMemoryGraphObjectStore, object_type: &str) -> Vec<Arc<Self>> {
        buffer.relationships_of_type(object_type)
    }

    fn collect_by_step(buffer: &InMemoryGraphObjectStore) -> BTreeMap<String, Vec<Arc<Self>>> {
        buffer.collect_relationships_by_step()
    }

    fn remove_flushed(buffer: &InMemoryGraphObjectStore, objects: &[Arc<Self>]) -> Result<()> {
        buffer.flush_relationships(objects)
    }

    fn encode_file(objects: &[Arc<Self>], pretty: bool) -> Result<Vec<u8>> {
        encode(
            &RelationshipsFileOut {
                relationships: objects,
            },
            pretty,
        )
    }

    fn decode_file(bytes: &[u8]) -> Result<Vec<Self>> {
        Ok(deserialize_value::<RelationshipsFileIn>(bytes)?.relationships)
    }

    fn notify<'a>(listener: &'a dyn FlushListener, objects: Vec<Arc<Self>>) -> BoxFuture<'a, ()> {
        listener.relationships_flushed(objects)
    }
}

/// Reads every graph file a step wrote to `blobs`, in file-name order.
pub(crate) async fn read_step_graph_files<T: GraphFileObject>(
    blobs: &dyn BlobStore,
    step_id: &str,
) -> Result<Vec<T>> {
    let mut objects = Vec::new();
    for path in blobs.list(&graph_dir(step_id, T::COLLECTION)).await? {
        let bytes = blobs.read(&path).await?;
        objects.extend(T::decode_file(&bytes)?);
    }
    Ok(objects)
}

fn group_by_type<T: GraphObject>(objects: Vec<Arc<T>>) -> BTreeMap<String, Vec<Arc<T>>> {
    let mut groups: BTreeMap<String, Vec<Arc<T>>> = BTreeMap::new();
    for object in objects {
        groups
            .entry(object.object_type().to_string())
            .or_default()
            .push(object);
    }
    groups
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone)]
struct DiskLocation {
    path: String,
    index: usize,
}

pub struct FileSystemGraphObjectStore {
    blobs: Arc<dyn BlobStore>,
    config: FileSystemStoreConfig,
    buffer: InMemoryGraphObjectStore,
    flush_lock: Mutex<()>,
    locations: RwLock<BigMap<String, DiskLocation>>,
    // (step id, _type) -> durable indexing enabled
    index_policy: HashMap<(String, String), bool>,
}

impl std::fmt::Debug for FileSystemGraphObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemGraphObjectStore")
            .field("blobs", &self.blobs)
            .field("config", &self.config)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl FileSystemGraphObjectStore {
    pub fn new(blobs: Arc<dyn BlobStore>, config: FileSystemStoreConfig) -> Self {
        Self {
            blobs,
            config,
            buffer: InMemoryGraphObjectStore::new(),
            flush_lock: Mutex::new(()),
            locations: RwLock::new(BigMap::new(LOCATION_INDEX_SHARD_SIZE)),
            index_policy: HashMap::new(),
        }
    }

    /// Picks up the `index_metadata` of every declared type.
    pub fn with_step_metadata(mut self, steps: &[StepMetadata]) -> Self {
        for step in steps {
            let declared = step
                .entities
                .iter()
                .chain(&step.relationships)
                .chain(&step.mapped_relationships);
            for meta in declared {
                if let Some(index) = meta.index_metadata {
                    self.index_policy
                        .insert((step.id.clone(), meta.object_type.clone()), index.enabled);
                }
            }
        }
        self
    }

    /// Enables or disables durable indexing for one (step, `_type`) pair.
    pub fn with_index_policy(
        mut self,
        step_id: impl Into<String>,
        object_type: impl Into<String>,
        enabled: bool,
    ) -> Self {
        self.index_policy
            .insert((step_id.into(), object_type.into()), enabled);
        self
    }

    pub fn config(&self) -> &FileSystemStoreConfig {
        &self.config
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// The in-memory write buffer.
    pub fn buffer(&self) -> &InMemoryGraphObjectStore {
        &self.buffer
    }

    fn is_indexed(&self, step_id: &str, object_type: &str) -> bool {
        self.index_policy
            .get(&(step_id.to_string(), object_type.to_string()))
            .copied()
            .unwrap_or(true)
    }

    fn threshold_reached<T: GraphFileObject>(&self) -> bool {
        let (items, bytes) = T::buffered(&self.buffer);
        items > 0
            && (items >= self.config.graph_object_buffer_threshold
                || bytes >= self.config.graph_object_buffer_threshold_in_bytes)
    }

    pub async fn flush_entities_to_disk(&self, listener: Option<&dyn FlushListener>) -> Result<()> {
        self.flush_to_disk::<Entity>(listener, true).await
    }

    pub async fn flush_relationships_to_disk(
        &self,
        listener: Option<&dyn FlushListener>,
    ) -> Result<()> {
        self.flush_to_disk::<Relationship>(listener, true).await
    }

    async fn flush_to_disk<T: GraphFileObject>(
        &self,
        listener: Option<&dyn FlushListener>,
        force: bool,
    ) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        // Another flush may have drained the buffer while we waited.
        if !force && !self.threshold_reached::<T>() {
            return Ok(());
        }

        for (step_id, objects) in T::collect_by_step(&self.buffer) {
            let durable: Vec<Arc<T>> = objects
                .iter()
                .filter(|o| self.is_indexed(&step_id, o.object_type()))
                .cloned()
                .collect();

            let mut files = 0usize;
            for (object_type, group) in group_by_type(durable) {
                for chunk in group.chunks(self.config.graph_object_file_size.max(1)) {
                    let path = self
                        .write_graph_file::<T>(&step_id, &object_type, chunk)
                        .await?;
                    if T::COLLECTION == Collection::Entities {
                        self.record_locations(&path, chunk);
                    }
                    files += 1;
                }
            }

            T::remove_flushed(&self.buffer, &objects)?;
            debug!(
                "Flushed {} {} for step {} into {} files",
                objects.len(),
                T::COLLECTION,
                step_id,
                files
            );

            if let Some(listener) = listener {
                T::notify(listener, objects).await;
            }
        }

        Ok(())
    }

    async fn write_graph_file<T: GraphFileObject>(
        &self,
        step_id: &str,
        object_type: &str,
        objects: &[Arc<T>],
    ) -> Result<String> {
        let file_name = format!("{}.json", Uuid::new_v4());
        let path = graph_file_path(step_id, T::COLLECTION, &file_name);
        let bytes = T::encode_file(objects, self.config.pretty_files)?;

        self.blobs.write(&path, &bytes).await?;
        self.blobs
            .link(
                &path,
                &index_file_path(T::COLLECTION, object_type, &file_name),
            )
            .await?;
        Ok(path)
    }

    fn record_locations<T: GraphObject>(&self, path: &str, objects: &[Arc<T>]) {
        let mut locations = self
            .locations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, object) in objects.iter().enumerate() {
            locations.insert(
                object.key().to_string(),
                DiskLocation {
                    path: path.to_string(),
                    index,
                },
            );
        }
    }

    async fn iterate<T: GraphFileObject>(
        &self,
        object_type: &str,
    ) -> Result<BoxStream<'static, Result<Arc<T>>>> {
        let (buffered, files) = {
            let _guard = self.flush_lock.lock().await;
            let buffered = T::of_type(&self.buffer, object_type);
            let files = self
                .blobs
                .list(&index_dir(T::COLLECTION, object_type))
                .await?;
            (buffered, files)
        };

        let blobs = self.blobs.clone();
        let on_disk = stream::iter(files)
            .then(move |path| {
                let blobs = blobs.clone();
                async move {
                    let bytes = blobs.read(&path).await?;
                    T::decode_file(&bytes)
                }
            })
            .map_ok(|objects| {
                stream::iter(
                    objects
                        .into_iter()
                        .map(|o| Ok::<_, StorageError>(Arc::new(o))),
                )
            })
            .try_flatten();

        Ok(stream::iter(buffered.into_iter().map(Ok))
            .chain(on_disk)
            .boxed())
    }
}

#[async_trait]
impl GraphObjectStore for FileSystemGraphObjectStore {
    async fn add_entities(
        &self,
        step_id: &str,
        entities: Vec<Entity>,
        listener: Option<&dyn FlushListener>,
    ) -> Result<()> {
        self.buffer.add_entities(step_id, entities)?;
        if self.threshold_reached::<Entity>() {
            self.flush_to_disk::<Entity>(listener, false).await?;
        }
        Ok(())
    }

    async fn add_relationships(
        &self,
        step_id: &str,
        relationships: Vec<Relationship>,
        listener: Option<&dyn FlushListener>,
    ) -> Result<()> {
        self.buffer.add_relationships(step_id, relationships)?;
        if self.threshold_reached::<Relationship>() {
            self.flush_to_disk::<Relationship>(listener, false).await?;
        }
        Ok(())
    }

    /// Checks the buffer, then the on-disk location index.
    async fn find_entity(&self, key: &str) -> Result<Option<Arc<Entity>>> {
        if let Some(entity) = self.buffer.find_entity(key) {
            return Ok(Some(entity));
        }

        let location = self
            .locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        let Some(location) = location else {
            return Ok(None);
        };

        let bytes = self.blobs.read(&location.path).await?;
        let mut entities = Entity::decode_file(&bytes)?;
        if location.index >= entities.len() {
            return Err(StorageError::CorruptLocation {
                path: location.path,
                index: location.index,
            });
        }
        Ok(Some(Arc::new(entities.swap_remove(location.index))))
    }

    async fn iterate_entities(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Entity>>>> {
        self.iterate::<Entity>(&filter.object_type).await
    }

    async fn iterate_relationships(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Relationship>>>> {
        self.iterate::<Relationship>(&filter.object_type).await
    }

    /// Flushes both collections, ignoring the thresholds.
    async fn flush(&self, listener: Option<&dyn FlushListener>) -> Result<()> {
        futures::try_join!(
            self.flush_to_disk::<Entity>(listener, true),
            self.flush_to_disk::<Relationship>(listener, true),
        )?;
        Ok(())
    }
}
