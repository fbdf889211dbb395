//! In-memory graph object store.
//!
//! Objects are kept by `_key` and indexed by `_type` and by the step that
//! produced them. Each object also remembers the size of its JSON encoding
//! so callers can apply a byte threshold without re-serializing.
//!
//! Used on its own for runs that keep everything in memory, and as the write
//! buffer of [`super::FileSystemGraphObjectStore`]. On its own, a flush keeps
//! the objects and hands each one to a flush listener exactly once.

use super::error::{Result, StorageError};
use super::{FlushListener, GraphObjectStore};
use crate::core::{serialized_size, Entity, GraphObject, GraphObjectFilter, Relationship};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

struct Buffered<T> {
    step_id: String,
    object: Arc<T>,
    size: usize,
    seq: u64,
}

/// One collection (entities or relationships) with its indexes.
///
/// The `_type` and step indexes map an insertion sequence number to a key,
/// so every listing comes back in insertion order. `unannounced` holds the
/// objects not yet handed to a flush listener.
struct ObjectBuffer<T> {
    objects: HashMap<String, Buffered<T>>,
    by_type: HashMap<String, BTreeMap<u64, String>>,
    by_step: HashMap<String, BTreeMap<u64, String>>,
    unannounced: BTreeMap<u64, String>,
    bytes: usize,
    next_seq: u64,
}

impl<T: GraphObject> ObjectBuffer<T> {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
            by_type: HashMap::new(),
            by_step: HashMap::new(),
            unannounced: BTreeMap::new(),
            bytes: 0,
            next_seq: 0,
        }
    }

    fn insert(&mut self, step_id: &str, object: Arc<T>, size: usize) {
        let key = object.key().to_string();
        self.remove_key(&key);

        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_type
            .entry(object.object_type().to_string())
            .or_default()
            .insert(seq, key.clone());
        self.by_step
            .entry(step_id.to_string())
            .or_default()
            .insert(seq, key.clone());
        self.unannounced.insert(seq, key.clone());
        self.bytes += size;
        self.objects.insert(
            key,
            Buffered {
                step_id: step_id.to_string(),
                object,
                size,
                seq,
            },
        );
    }

    fn remove_key(&mut self, key: &str) -> Option<Buffered<T>> {
        let buffered = self.objects.remove(key)?;
        let object_type = buffered.object.object_type();

        if let Some(keys) = self.by_type.get_mut(object_type) {
            keys.remove(&buffered.seq);
            if keys.is_empty() {
                self.by_type.remove(object_type);
            }
        }
        if let Some(keys) = self.by_step.get_mut(&buffered.step_id) {
            keys.remove(&buffered.seq);
            if keys.is_empty() {
                self.by_step.remove(&buffered.step_id);
            }
        }
        self.unannounced.remove(&buffered.seq);
        self.bytes = self.bytes.saturating_sub(buffered.size);
        Some(buffered)
    }

    fn is_indexed(&self, object: &T) -> bool {
        self.objects
            .get(object.key())
            .zip(self.by_type.get(object.object_type()))
            .is_some_and(|(buffered, keys)| keys.contains_key(&buffered.seq))
    }

    /// Removes exactly the given objects. Fails without removing anything if
    /// one of them is not in the `_type` index.
    fn flush(&mut self, objects: &[Arc<T>]) -> Result<()> {
        if let Some(missing) = objects.iter().find(|o| !self.is_indexed(o)) {
            return Err(StorageError::MissingIndexEntry {
                key: missing.key().to_string(),
                object_type: missing.object_type().to_string(),
            });
        }

        for object in objects {
            self.remove_key(object.key());
        }
        Ok(())
    }

    /// Objects added since the last call, in insertion order.
    fn take_unannounced(&mut self) -> Vec<Arc<T>> {
        std::mem::take(&mut self.unannounced)
            .into_values()
            .filter_map(|key| self.objects.get(&key))
            .map(|buffered| buffered.object.clone())
            .collect()
    }

    fn of_type(&self, object_type: &str) -> Vec<Arc<T>> {
        self.by_type
            .get(object_type)
            .map(|keys| {
                keys.values()
                    .filter_map(|key| self.objects.get(key))
                    .map(|buffered| buffered.object.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn by_step(&self) -> BTreeMap<String, Vec<Arc<T>>> {
        self.by_step
            .iter()
            .map(|(step_id, keys)| {
                let objects = keys
                    .values()
                    .filter_map(|key| self.objects.get(key))
                    .map(|buffered| buffered.object.clone())
                    .collect();
                (step_id.clone(), objects)
            })
            .collect()
    }
}

struct MemoryState {
    entities: ObjectBuffer<Entity>,
    relationships: ObjectBuffer<Relationship>,
}

pub struct InMemoryGraphObjectStore {
    state: RwLock<MemoryState>,
}

impl Default for InMemoryGraphObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryGraphObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryGraphObjectStore")
            .field("entities", &self.total_entity_item_count())
            .field("relationships", &self.total_relationship_item_count())
            .finish()
    }
}

impl InMemoryGraphObjectStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                entities: ObjectBuffer::new(),
                relationships: ObjectBuffer::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers entities under `step_id` and returns the shared handles.
    pub fn add_entities(&self, step_id: &str, entities: Vec<Entity>) -> Result<Vec<Arc<Entity>>> {
        let sized = with_sizes(entities)?;
        let mut state = self.write();
        Ok(sized
            .into_iter()
            .map(|(entity, size)| {
                state.entities.insert(step_id, entity.clone(), size);
                entity
            })
            .collect())
    }

    pub fn add_relationships(
        &self,
        step_id: &str,
        relationships: Vec<Relationship>,
    ) -> Result<Vec<Arc<Relationship>>> {
        let sized = with_sizes(relationships)?;
        let mut state = self.write();
        Ok(sized
            .into_iter()
            .map(|(relationship, size)| {
                state.relationships.insert(step_id, relationship.clone(), size);
                relationship
            })
            .collect())
    }

    pub fn find_entity(&self, key: &str) -> Option<Arc<Entity>> {
        self.read()
            .entities
            .objects
            .get(key)
            .map(|buffered| buffered.object.clone())
    }

    /// Buffered entities of one `_type`, in insertion order.
    pub fn entities_of_type(&self, object_type: &str) -> Vec<Arc<Entity>> {
        self.read().entities.of_type(object_type)
    }

    pub fn relationships_of_type(&self, object_type: &str) -> Vec<Arc<Relationship>> {
        self.read().relationships.of_type(object_type)
    }

    /// Removes the given entities from every index.
    pub fn flush_entities(&self, entities: &[Arc<Entity>]) -> Result<()> {
        self.write().entities.flush(entities)
    }

    pub fn flush_relationships(&self, relationships: &[Arc<Relationship>]) -> Result<()> {
        self.write().relationships.flush(relationships)
    }

    /// Buffered entities grouped by the step that produced them.
    pub fn collect_entities_by_step(&self) -> BTreeMap<String, Vec<Arc<Entity>>> {
        self.read().entities.by_step()
    }

    pub fn collect_relationships_by_step(&self) -> BTreeMap<String, Vec<Arc<Relationship>>> {
        self.read().relationships.by_step()
    }

    pub fn total_entity_item_count(&self) -> usize {
        self.read().entities.objects.len()
    }

    pub fn total_relationship_item_count(&self) -> usize {
        self.read().relationships.objects.len()
    }

    /// Summed JSON size of the buffered entities.
    pub fn total_entity_byte_size(&self) -> usize {
        self.read().entities.bytes
    }

    pub fn total_relationship_byte_size(&self) -> usize {
        self.read().relationships.bytes
    }

    pub fn has_key(&self, key: &str) -> bool {
        let state = self.read();
        state.entities.objects.contains_key(key) || state.relationships.objects.contains_key(key)
    }
}

/// Sizes a batch before anything is buffered, so a rejected batch leaves
/// the store untouched.
fn with_sizes<T: GraphObject>(objects: Vec<T>) -> Result<Vec<(Arc<T>, usize)>> {
    objects
        .into_iter()
        .map(|object| {
            if let Some(property) = object.reserved_property() {
                return Err(StorageError::ReservedProperty {
                    key: object.key().to_string(),
                    property: property.to_string(),
                });
            }
            let size = serialized_size(&object)?;
            Ok((Arc::new(object), size))
        })
        .collect()
}

#[async_trait]
impl GraphObjectStore for InMemoryGraphObjectStore {
    async fn add_entities(
        &self,
        step_id: &str,
        entities: Vec<Entity>,
        _listener: Option<&dyn FlushListener>,
    ) -> Result<()> {
        InMemoryGraphObjectStore::add_entities(self, step_id, entities).map(|_| ())
    }

    async fn add_relationships(
        &self,
        step_id: &str,
        relationships: Vec<Relationship>,
        _listener: Option<&dyn FlushListener>,
    ) -> Result<()> {
        InMemoryGraphObjectStore::add_relationships(self, step_id, relationships).map(|_| ())
    }

    async fn find_entity(&self, key: &str) -> Result<Option<Arc<Entity>>> {
        Ok(InMemoryGraphObjectStore::find_entity(self, key))
    }

    async fn iterate_entities(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Entity>>>> {
        let snapshot = self.entities_of_type(&filter.object_type);
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn iterate_relationships(
        &self,
        filter: &GraphObjectFilter,
    ) -> Result<BoxStream<'static, Result<Arc<Relationship>>>> {
        let snapshot = self.relationships_of_type(&filter.object_type);
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    /// Keeps every object in memory. With a listener, hands it the objects
    /// added since its previous flush; without one, there is nothing to do.
    async fn flush(&self, listener: Option<&dyn FlushListener>) -> Result<()> {
        let Some(listener) = listener else {
            return Ok(());
        };

        let (entities, relationships) = {
            let mut state = self.write();
            (
                state.entities.take_unannounced(),
                state.relationships.take_unannounced(),
            )
        };
        if !entities.is_empty() {
            listener.entities_flushed(entities).await;
        }
        if !relationships.is_empty() {
            listener.relationships_flushed(relationships).await;
        }
        Ok(())
    }
}
