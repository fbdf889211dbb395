//! The facade a step handler uses to read and write graph objects.
//!
//! Every write goes through the same pipeline:
//!
//! 1. interceptors (`before_add`) may rewrite or reject each object
//! 2. every `_key` is registered with the run's [`DuplicateKeyTracker`]
//! 3. per-type counts are recorded in the [`TypeTracker`]
//! 4. the batch is handed to the store, with the step's upload queue as
//!    flush listener
//! 5. interceptors (`after_add`) observe what was stored

use super::error::{ExecutionError, Result, UploadQueueError};
use super::interceptor::{EntityInterceptor, RelationshipInterceptor};
use super::upload::UploadQueue;
use crate::core::{Entity, GraphObjectFilter, Relationship};
use crate::storage::{DataStore, FlushListener, GraphObjectStore};
use crate::tracking::{DuplicateKeyTracker, KeyMetadata, TypeTracker};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Everything a run shares between its steps.
pub(crate) struct RunResources {
    pub store: Arc<dyn GraphObjectStore>,
    pub duplicate_keys: Arc<DuplicateKeyTracker>,
    pub type_tracker: Arc<TypeTracker>,
    pub data: Arc<DataStore>,
    pub entity_interceptors: Vec<Arc<dyn EntityInterceptor>>,
    pub relationship_interceptors: Vec<Arc<dyn RelationshipInterceptor>>,
}

impl RunResources {
    pub fn new(store: Arc<dyn GraphObjectStore>) -> Self {
        Self {
            store,
            duplicate_keys: Arc::new(DuplicateKeyTracker::new()),
            type_tracker: Arc::new(TypeTracker::new()),
            data: Arc::new(DataStore::new()),
            entity_interceptors: Vec::new(),
            relationship_interceptors: Vec::new(),
        }
    }
}

/// Per-step view of the run's shared state.
///
/// Cheap to clone; clones share everything, including the upload queue.
#[derive(Clone)]
pub struct JobState {
    step_id: Arc<str>,
    run: Arc<RunResources>,
    uploader: Option<Arc<UploadQueue>>,
}

impl JobState {
    pub(crate) fn new(
        step_id: &str,
        run: Arc<RunResources>,
        uploader: Option<Arc<UploadQueue>>,
    ) -> Self {
        Self {
            step_id: Arc::from(step_id),
            run,
            uploader,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    fn listener(&self) -> Option<&dyn FlushListener> {
        self.uploader.as_deref().map(|u| u as &dyn FlushListener)
    }

    fn track_types<'a>(&self, types: impl Iterator<Item = &'a str>) {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for object_type in types {
            *counts.entry(object_type).or_insert(0) += 1;
        }
        for (object_type, count) in counts {
            self.run
                .type_tracker
                .add_step_graph_object_type(&self.step_id, object_type, count);
        }
    }

    // =========================================================================
    // ENTITIES
    // =========================================================================

    pub async fn add_entity(&self, entity: Entity) -> Result<()> {
        self.add_entities(vec![entity]).await
    }

    /// Adds entities to the run.
    ///
    /// Fails on the first rejected entity or duplicate `_key`; entities
    /// registered before the failing one keep their keys.
    pub async fn add_entities(&self, entities: Vec<Entity>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let entities = entities
            .into_iter()
            .map(|entity| self.intercept_entity(entity))
            .collect::<Result<Vec<_>>>()?;

        for entity in &entities {
            self.run
                .duplicate_keys
                .register_key(&entity.key, KeyMetadata::new(&entity.key, &entity.object_type))?;
        }
        self.track_types(entities.iter().map(|e| e.object_type.as_str()));

        let observed = (!self.run.entity_interceptors.is_empty()).then(|| entities.clone());
        self.run
            .store
            .add_entities(&self.step_id, entities, self.listener())
            .await?;

        for entity in observed.iter().flatten() {
            for interceptor in &self.run.entity_interceptors {
                interceptor.after_add(&self.step_id, entity);
            }
        }
        Ok(())
    }

    fn intercept_entity(&self, entity: Entity) -> Result<Entity> {
        self.run
            .entity_interceptors
            .iter()
            .try_fold(entity, |entity, interceptor| {
                let key = entity.key.clone();
                interceptor
                    .before_add(&self.step_id, entity)
                    .map_err(|source| ExecutionError::Rejected { key, source })
            })
    }

    /// Looks an entity up by `_key`, failing when it does not exist.
    pub async fn get_entity(&self, key: &str) -> Result<Arc<Entity>> {
        self.find_entity(key)
            .await?
            .ok_or_else(|| ExecutionError::EntityNotFound {
                key: key.to_string(),
            })
    }

    pub async fn find_entity(&self, key: &str) -> Result<Option<Arc<Entity>>> {
        Ok(self.run.store.find_entity(key).await?)
    }

    /// Runs `iteratee` on every entity of the filtered type, one at a time.
    ///
    /// Stops at the first error, from the store or from `iteratee`.
    pub async fn iterate_entities<F, Fut, E>(
        &self,
        filter: &GraphObjectFilter,
        mut iteratee: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(Arc<Entity>) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<ExecutionError>,
    {
        let mut stream = self
            .run
            .store
            .iterate_entities(filter)
            .await
            .map_err(ExecutionError::from)?;
        while let Some(entity) = stream.next().await {
            iteratee(entity.map_err(ExecutionError::from)?).await?;
        }
        Ok(())
    }

    // =========================================================================
    // RELATIONSHIPS
    // =========================================================================

    pub async fn add_relationship(&self, relationship: Relationship) -> Result<()> {
        self.add_relationships(vec![relationship]).await
    }

    pub async fn add_relationships(&self, relationships: Vec<Relationship>) -> Result<()> {
        if relationships.is_empty() {
            return Ok(());
        }

        let relationships = relationships
            .into_iter()
            .map(|relationship| self.intercept_relationship(relationship))
            .collect::<Result<Vec<_>>>()?;

        for relationship in &relationships {
            self.run.duplicate_keys.register_key(
                &relationship.key,
                KeyMetadata::new(&relationship.key, &relationship.object_type),
            )?;
        }
        self.track_types(relationships.iter().map(|r| r.object_type.as_str()));

        let observed =
            (!self.run.relationship_interceptors.is_empty()).then(|| relationships.clone());
        self.run
            .store
            .add_relationships(&self.step_id, relationships, self.listener())
            .await?;

        for relationship in observed.iter().flatten() {
            for interceptor in &self.run.relationship_interceptors {
                interceptor.after_add(&self.step_id, relationship);
            }
        }
        Ok(())
    }

    fn intercept_relationship(&self, relationship: Relationship) -> Result<Relationship> {
        self.run
            .relationship_interceptors
            .iter()
            .try_fold(relationship, |relationship, interceptor| {
                let key = relationship.key.clone();
                interceptor
                    .before_add(&self.step_id, relationship)
                    .map_err(|source| ExecutionError::Rejected { key, source })
            })
    }

    pub async fn iterate_relationships<F, Fut, E>(
        &self,
        filter: &GraphObjectFilter,
        mut iteratee: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(Arc<Relationship>) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<ExecutionError>,
    {
        let mut stream = self
            .run
            .store
            .iterate_relationships(filter)
            .await
            .map_err(ExecutionError::from)?;
        while let Some(relationship) = stream.next().await {
            iteratee(relationship.map_err(ExecutionError::from)?).await?;
        }
        Ok(())
    }

    // =========================================================================
    // KEYS AND DATA
    // =========================================================================

    /// True if any step already registered `key` (after normalization).
    pub fn has_key(&self, key: &str) -> bool {
        self.run.duplicate_keys.has_key(key)
    }

    pub fn set_data<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        Ok(self.run.data.set(key, value)?)
    }

    pub fn get_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.run.data.get(key)?)
    }

    pub fn delete_data(&self, key: &str) -> bool {
        self.run.data.delete(key)
    }

    // =========================================================================
    // FLUSHING
    // =========================================================================

    /// Forces buffered objects out of the store, through this step's uploader.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.run.store.flush(self.listener()).await?)
    }

    /// Waits for this step's uploads. Succeeds immediately without an uploader.
    pub async fn wait_until_uploads_complete(&self) -> std::result::Result<(), UploadQueueError> {
        match &self.uploader {
            Some(uploader) => uploader.wait_until_uploads_complete().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobState")
            .field("step_id", &self.step_id)
            .field("uploader", &self.uploader)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::error::BoxError;
    use crate::storage::InMemoryGraphObjectStore;
    use std::sync::Mutex;

    fn run() -> Arc<RunResources> {
        Arc::new(RunResources::new(Arc::new(InMemoryGraphObjectStore::new())))
    }

    fn user(key: &str) -> Entity {
        Entity::new(key, "acme_user", "User")
    }

    #[tokio::test]
    async fn test_add_and_get_entity() {
        let job_state = JobState::new("s", run(), None);
        job_state.add_entity(user("u1")).await.unwrap();

        assert_eq!(job_state.get_entity("u1").await.unwrap().key, "u1");
        assert!(job_state.has_key("u1"));
        assert!(matches!(
            job_state.get_entity("missing").await,
            Err(ExecutionError::EntityNotFound { key }) if key == "missing"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_key_across_steps_fails() {
        let run = run();
        let a = JobState::new("a", run.clone(), None);
        let b = JobState::new("b", run, None);

        a.add_entity(user("u1")).await.unwrap();
        let error = b
            .add_relationship(Relationship::direct("u1", "x", "HAS", "u1", "u2"))
            .await
            .unwrap_err();

        assert!(matches!(error, ExecutionError::DuplicateKey(e) if e.existing_type == "acme_user"));
    }

    #[tokio::test]
    async fn test_types_are_counted_per_step() {
        let run = run();
        let job_state = JobState::new("s", run.clone(), None);
        job_state
            .add_entities(vec![user("u1"), user("u2"), Entity::new("g1", "acme_group", "Group")])
            .await
            .unwrap();

        assert_eq!(
            run.type_tracker.encountered_types_for_step("s"),
            vec!["acme_group", "acme_user"]
        );
        assert_eq!(run.type_tracker.summarize_step("s")["acme_user"].total, 2);
    }

    #[derive(Default)]
    struct Tagger {
        seen: Mutex<Vec<String>>,
    }

    impl EntityInterceptor for Tagger {
        fn before_add(&self, _step_id: &str, entity: Entity) -> std::result::Result<Entity, BoxError> {
            if entity.key.starts_with("blocked") {
                return Err("blocked key".into());
            }
            Ok(entity.with_property("tagged", true))
        }

        fn after_add(&self, step_id: &str, entity: &Entity) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", step_id, entity.key));
        }
    }

    #[tokio::test]
    async fn test_interceptors_rewrite_and_reject() {
        let tagger = Arc::new(Tagger::default());
        let mut resources = RunResources::new(Arc::new(InMemoryGraphObjectStore::new()));
        resources.entity_interceptors.push(tagger.clone());
        let job_state = JobState::new("s", Arc::new(resources), None);

        job_state.add_entity(user("u1")).await.unwrap();
        let stored = job_state.get_entity("u1").await.unwrap();
        assert_eq!(stored.property("tagged"), Some(&serde_json::json!(true)));
        assert_eq!(*tagger.seen.lock().unwrap(), vec!["s:u1"]);

        let error = job_state.add_entity(user("blocked-1")).await.unwrap_err();
        assert!(matches!(error, ExecutionError::Rejected { key, .. } if key == "blocked-1"));
        assert!(!job_state.has_key("blocked-1"));
    }

    #[tokio::test]
    async fn test_iterate_entities_stops_on_error() {
        let job_state = JobState::new("s", run(), None);
        job_state
            .add_entities(vec![user("u1"), user("u2"), user("u3")])
            .await
            .unwrap();

        let mut visited = Vec::new();
        let result: std::result::Result<(), ExecutionError> = job_state
            .iterate_entities(&GraphObjectFilter::of_type("acme_user"), |entity| {
                visited.push(entity.key.clone());
                let stop = visited.len() == 2;
                async move {
                    if stop {
                        Err(ExecutionError::EntityNotFound {
                            key: entity.key.clone(),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(visited, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_data_is_shared_between_steps() {
        let run = run();
        let a = JobState::new("a", run.clone(), None);
        let b = JobState::new("b", run, None);

        a.set_data("cursor", &"page-2").unwrap();
        assert_eq!(b.get_data::<String>("cursor").unwrap().as_deref(), Some("page-2"));
        assert!(b.delete_data("cursor"));
        assert_eq!(a.get_data::<String>("cursor").unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_without_uploader_succeeds() {
        let job_state = JobState::new("s", run(), None);
        job_state.flush().await.unwrap();
        job_state.wait_until_uploads_complete().await.unwrap();
    }
}
