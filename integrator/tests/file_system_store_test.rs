//! File system graph object store over a real directory
//!
//! This test verifies that:
//! 1. Everything added can be iterated back exactly once, whatever the buffer threshold
//! 2. Entities flushed to disk are still found by `_key`
//! 3. A dependent step sees everything its concurrent dependencies flushed
//! 4. Objects shadowing reserved fields never reach a graph file
//! 5. A later run can hydrate a step from an earlier run's files
//! 6. The run summary lands in `summary.json`

use futures::TryStreamExt;
use integrator::core::GraphObjectClass;
use integrator::prelude::*;
use integrator::storage::{BlobStore, StorageError, SUMMARY_FILE};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn user(i: usize) -> Entity {
    Entity::new(format!("user-{}", i), "acme_user", "User").with_property("index", i as u64)
}

fn file_store(root: &Path, config: FileSystemStoreConfig) -> FileSystemGraphObjectStore {
    FileSystemGraphObjectStore::new(Arc::new(FileBlobStore::new(root)), config)
}

/// Every stored `acme_user` key, sorted but not deduplicated.
async fn stored_user_keys(store: &dyn GraphObjectStore) -> Vec<String> {
    let users: Vec<Arc<Entity>> = store
        .iterate_entities(&GraphObjectFilter::of_type("acme_user"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let mut keys: Vec<String> = users.iter().map(|u| u.key.clone()).collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_iteration_sees_every_object_regardless_of_threshold() {
    let mut expected: Vec<String> = (0..25).map(|i| format!("user-{}", i)).collect();
    expected.sort();

    for threshold in [1, 7, 25, 1_000] {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(
            dir.path(),
            FileSystemStoreConfig::default()
                .with_buffer_threshold(threshold)
                .with_file_size(4),
        );

        for i in 0..25 {
            store.add_entities("users", vec![user(i)], None).await.unwrap();
        }

        assert_eq!(
            stored_user_keys(&store).await,
            expected,
            "threshold {}",
            threshold
        );

        store.flush(None).await.unwrap();
        assert_eq!(store.buffer().total_entity_item_count(), 0);
        assert_eq!(
            stored_user_keys(&store).await,
            expected,
            "threshold {} after flush",
            threshold
        );
    }
}

#[tokio::test]
async fn test_find_entity_after_flush_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path(), FileSystemStoreConfig::default().with_file_size(2));

    store
        .add_entities("users", (0..5).map(user).collect(), None)
        .await
        .unwrap();
    store.flush(None).await.unwrap();

    let found = store.find_entity("user-3").await.unwrap().unwrap();
    assert_eq!(found.property("index"), Some(&serde_json::json!(3)));
    assert!(store.find_entity("user-99").await.unwrap().is_none());

    let graph_files = store
        .blob_store()
        .list("graph/users/entities")
        .await
        .unwrap();
    assert_eq!(graph_files.len(), 3);
}

#[tokio::test]
async fn test_dependent_sees_everything_concurrent_producers_flushed() {
    const PRODUCERS: usize = 10;
    const PER_PRODUCER: usize = 20;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(file_store(
        dir.path(),
        FileSystemStoreConfig::default()
            .with_buffer_threshold(3)
            .with_file_size(4),
    ));

    let mut steps: Vec<Step> = (0..PRODUCERS)
        .map(|p| {
            Step::new(format!("producer-{}", p), format!("Producer {}", p))
                .entity_type("acme_user")
                .handler(move |ctx| async move {
                    for i in 0..PER_PRODUCER {
                        let entity = Entity::new(format!("p{}-{}", p, i), "acme_user", "User");
                        ctx.job_state.add_entity(entity).await?;
                        tokio::task::yield_now().await;
                    }
                    Ok(())
                })
        })
        .collect();

    let seen = Arc::new(AtomicUsize::new(0));
    let reader_seen = seen.clone();
    let mut reader = Step::new("reader", "Reader").handler(move |ctx| {
        let seen = reader_seen.clone();
        async move {
            ctx.job_state
                .iterate_entities(&GraphObjectFilter::of_type("acme_user"), |_user| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), StepError>(()) }
                })
                .await?;
            let found = ctx.job_state.get_entity("p3-7").await?;
            assert_eq!(found.object_type, "acme_user");
            Ok(())
        }
    });
    for p in 0..PRODUCERS {
        reader = reader.depends_on(format!("producer-{}", p));
    }
    steps.push(reader);

    let graph = build_step_dependency_graph(steps).unwrap();
    let results = execute_step_dependency_graph(graph, StepStartStates::new(), store.clone())
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.status == StepResultStatus::Success));
    assert_eq!(seen.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);

    let keys = stored_user_keys(store.as_ref()).await;
    assert_eq!(keys.len(), PRODUCERS * PER_PRODUCER);
    assert!(keys.windows(2).all(|pair| pair[0] != pair[1]), "no duplicates");
}

#[tokio::test]
async fn test_reserved_property_never_reaches_a_graph_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path(), FileSystemStoreConfig::default());

    // Ignored by the builder.
    let shadowed = Entity::new("shadowed", "acme_user", "User").with_property("_class", "Other");
    store
        .add_entities("users", vec![user(1), shadowed], None)
        .await
        .unwrap();

    // Rejected at the store.
    let mut forced = user(2);
    forced
        .properties
        .insert("_type".to_string(), serde_json::json!("acme_admin"));
    let err = store
        .add_entities("users", vec![user(3), forced], None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ReservedProperty { ref key, .. } if key == "user-2"));

    store.flush(None).await.unwrap();

    assert_eq!(stored_user_keys(&store).await, vec!["shadowed", "user-1"]);
    let shadowed = store.find_entity("shadowed").await.unwrap().unwrap();
    assert_eq!(shadowed.class, GraphObjectClass::One("User".to_string()));
    assert!(store.find_entity("user-1").await.unwrap().is_some());
    assert!(store.find_entity("user-3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cached_step_is_hydrated_from_previous_run() {
    let previous_run = tempfile::tempdir().unwrap();
    let users_step = |ran: Arc<AtomicBool>| {
        Step::new("users", "Users")
            .entity_type("acme_user")
            .handler(move |ctx| {
                let ran = ran.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    ctx.job_state.add_entities((0..3).map(user).collect()).await?;
                    Ok(())
                }
            })
    };

    // First run writes the step's graph files.
    let first_ran = Arc::new(AtomicBool::new(false));
    let graph = build_step_dependency_graph(vec![users_step(first_ran.clone())]).unwrap();
    let store = Arc::new(file_store(previous_run.path(), FileSystemStoreConfig::default()));
    execute_step_dependency_graph(graph, StepStartStates::new(), store)
        .await
        .unwrap();
    assert!(first_ran.load(Ordering::SeqCst));

    // Second run loads them instead of calling the handler.
    let second_run = tempfile::tempdir().unwrap();
    let second_ran = Arc::new(AtomicBool::new(false));
    let graph = build_step_dependency_graph(vec![users_step(second_ran.clone())]).unwrap();
    let store = Arc::new(file_store(second_run.path(), FileSystemStoreConfig::default()));
    let start_states = HashMap::from([(
        "users".to_string(),
        StepStartState::cached(previous_run.path()),
    )]);

    let results = execute_step_dependency_graph(graph, start_states, store.clone())
        .await
        .unwrap();

    assert!(!second_ran.load(Ordering::SeqCst));
    assert_eq!(results[0].status, StepResultStatus::Cached);
    assert_eq!(results[0].encountered_type_counts["acme_user"], 3);
    assert_eq!(stored_user_keys(store.as_ref()).await.len(), 3);
}

#[tokio::test]
async fn test_summary_is_written_to_storage_root() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FileBlobStore::new(dir.path());

    let graph = build_step_dependency_graph(vec![
        Step::new("users", "Users").partial_entity_type("acme_user"),
        Step::new("groups", "Groups")
            .entity_type("acme_group")
            .handler(|_ctx| async { Err(StepError::from("timeout")) }),
    ])
    .unwrap();
    let store = Arc::new(file_store(dir.path(), FileSystemStoreConfig::default()));
    let results = execute_step_dependency_graph(graph, StepStartStates::new(), store)
        .await
        .unwrap();

    let summary = ExecutionSummary::from_results(results);
    summary.write_to(&blobs).await.unwrap();

    assert!(dir.path().join(SUMMARY_FILE).exists());
    let written = ExecutionSummary::read_from(&blobs).await.unwrap();
    assert_eq!(written.partial_types(), &["acme_group", "acme_user"]);
    assert_eq!(written.integration_step_results.len(), 2);
}
