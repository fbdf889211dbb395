//! Step dependency scheduler.
//!
//! Steps are scheduled with Kahn's algorithm over the step graph: a step is
//! submitted once every step it depends on has reached a terminal status,
//! and independent steps run concurrently (optionally bounded by
//! `max_concurrent_steps`).
//!
//! # Status flow
//!
//! ```text
//! PENDING_EVALUATION ──▶ handler ok ──▶ SUCCESS
//!        │                  │              └─ a dependency failed ──▶ PARTIAL_SUCCESS_DUE_TO_DEPENDENCY_FAILURE
//!        │                  └─ handler error / panic ──▶ FAILURE
//!        ├─ step cache path ──▶ CACHED
//!        └─ disabled (or a dependency disabled) ──▶ DISABLED, handler never runs
//! ```
//!
//! After its handler returns, a step's buffered data is flushed and its
//! uploads drained; a failed flush or upload turns the step into `FAILURE`.
//! Handler errors are absorbed into the step's result, except fatal ones
//! ([`StepError::fatal`]) which stop scheduling and are returned.

use super::config::ExecutorConfig;
use super::error::{ExecutionError, Result, StepError};
use super::interceptor::{EntityInterceptor, ExecutionHooks, RelationshipInterceptor};
use super::job_state::{JobState, RunResources};
use super::step::{Step, StepDependencyGraph, StepExecutionContext};
use super::upload::{GraphObjectSink, RetryingSink, UploadQueue};
use crate::core::{Entity, Relationship, StepResult, StepResultStatus, StepStartState, StepStartStates};
use crate::graph::{initial_step_results, StepGraph, StepId};
use crate::storage::{read_step_graph_files, DataStore, FileBlobStore, GraphObjectStore};
use crate::tracking::{DuplicateKeyTracker, TypeTracker};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs every step of `graph` against `store` with default settings.
pub async fn execute_step_dependency_graph(
    graph: StepDependencyGraph,
    start_states: StepStartStates,
    store: Arc<dyn GraphObjectStore>,
) -> Result<Vec<StepResult>> {
    StepGraphExecutor::new(graph, store)
        .with_start_states(start_states)
        .execute()
        .await
}

/// Configurable scheduler for one run of a [`StepDependencyGraph`].
///
/// ```
/// use integrator::executor::{build_step_dependency_graph, Step, StepGraphExecutor};
/// use integrator::core::{Entity, StepResultStatus};
/// use integrator::storage::InMemoryGraphObjectStore;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let graph = build_step_dependency_graph(vec![
///     Step::new("fetch-users", "Fetch Users")
///         .entity_type("acme_user")
///         .handler(|ctx| async move {
///             ctx.job_state.add_entity(Entity::new("u1", "acme_user", "User")).await?;
///             Ok(())
///         }),
///     Step::new("fetch-groups", "Fetch Groups").depends_on("fetch-users"),
/// ])?;
///
/// let results = StepGraphExecutor::new(graph, Arc::new(InMemoryGraphObjectStore::new()))
///     .execute()
///     .await?;
///
/// assert!(results.iter().all(|r| r.status == StepResultStatus::Success));
/// assert_eq!(results[0].encountered_types, vec!["acme_user"]);
/// # Ok(())
/// # }
/// ```
pub struct StepGraphExecutor {
    graph: StepDependencyGraph,
    start_states: StepStartStates,
    resources: RunResources,
    sink: Option<Arc<dyn GraphObjectSink>>,
    hooks: Option<Arc<dyn ExecutionHooks>>,
    config: ExecutorConfig,
}

impl StepGraphExecutor {
    pub fn new(graph: StepDependencyGraph, store: Arc<dyn GraphObjectStore>) -> Self {
        Self {
            graph,
            start_states: StepStartStates::new(),
            resources: RunResources::new(store),
            sink: None,
            hooks: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_start_states(mut self, start_states: StepStartStates) -> Self {
        self.start_states = start_states;
        self
    }

    /// Shares a key tracker with the caller, e.g. to inspect it after the run.
    pub fn with_duplicate_key_tracker(mut self, tracker: Arc<DuplicateKeyTracker>) -> Self {
        self.resources.duplicate_keys = tracker;
        self
    }

    pub fn with_type_tracker(mut self, tracker: Arc<TypeTracker>) -> Self {
        self.resources.type_tracker = tracker;
        self
    }

    pub fn with_data_store(mut self, data: Arc<DataStore>) -> Self {
        self.resources.data = data;
        self
    }

    /// Uploads flushed data to `sink`. Without a sink nothing is uploaded.
    pub fn with_sink(mut self, sink: Arc<dyn GraphObjectSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_entity_interceptor(mut self, interceptor: Arc<dyn EntityInterceptor>) -> Self {
        self.resources.entity_interceptors.push(interceptor);
        self
    }

    pub fn with_relationship_interceptor(
        mut self,
        interceptor: Arc<dyn RelationshipInterceptor>,
    ) -> Self {
        self.resources.relationship_interceptors.push(interceptor);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_concurrent_steps(mut self, limit: usize) -> Self {
        self.config = self.config.with_max_concurrent_steps(limit);
        self
    }

    /// Runs every step and returns one result per step, in step order.
    ///
    /// Fails only when the start states do not match the graph, a step
    /// returns a fatal error, or the final flush fails.
    pub async fn execute(self) -> Result<Vec<StepResult>> {
        let span = info_span!("step_graph", steps = self.graph.steps().len());
        self.schedule().instrument(span).await
    }

    async fn schedule(self) -> Result<Vec<StepResult>> {
        let StepGraphExecutor {
            graph,
            start_states,
            resources,
            sink,
            hooks,
            config,
        } = self;

        let steps = graph.steps();
        let step_graph = graph.graph();
        let mut results = initial_step_results(step_graph, &graph.metadata(), &start_states)?;

        let sink = sink.map(|sink| {
            if config.upload_retry.max_attempts > 1 {
                Arc::new(RetryingSink::new(sink, config.upload_retry)) as Arc<dyn GraphObjectSink>
            } else {
                sink
            }
        });
        let runner = Arc::new(StepRunner {
            run: Arc::new(resources),
            sink,
            hooks,
            upload_concurrency: config.upload_concurrency,
            step_permits: config
                .max_concurrent_steps
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
        });

        let mut in_degrees: Vec<usize> = steps
            .iter()
            .map(|step| step_graph.dependencies_of(&StepId::new(step.id())).len())
            .collect();
        let mut ready: VecDeque<usize> = (0..steps.len())
            .filter(|&position| in_degrees[position] == 0)
            .collect();
        let mut running: JoinSet<(usize, StepOutcome)> = JoinSet::new();
        let mut last_finished: Option<usize> = None;

        info!("Executing {} steps", steps.len());

        loop {
            while let Some(position) = ready.pop_front() {
                let step = &steps[position];

                if results[position].status == StepResultStatus::Disabled {
                    info!("Skipping disabled step {}", step.id());
                    for dependent in step_graph.transitive_dependents(&StepId::new(step.id())) {
                        if let Some(dependent) = step_graph.position(&dependent) {
                            results[dependent].status = StepResultStatus::Disabled;
                        }
                    }
                    release_dependents(step_graph, step.id(), &mut in_degrees, &mut ready);
                    continue;
                }

                let dependency_failed = step_graph
                    .dependencies_of(&StepId::new(step.id()))
                    .iter()
                    .filter_map(|dependency| step_graph.position(dependency))
                    .any(|dependency| results[dependency].status.is_failure_like());
                let start_state = start_states.get(step.id()).cloned().unwrap_or_default();

                debug!("Submitting step {}", step.id());
                running.spawn(runner.clone().run_step(
                    position,
                    step.clone(),
                    results[position].clone(),
                    start_state,
                    dependency_failed,
                ));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (position, outcome) =
                joined.map_err(|e| ExecutionError::TaskPanic(e.to_string()))?;

            match outcome {
                StepOutcome::Finished(result) => {
                    results[position] = result;
                    last_finished = Some(position);
                    release_dependents(step_graph, steps[position].id(), &mut in_degrees, &mut ready);
                }
                StepOutcome::Fatal(source) => {
                    let step_id = steps[position].id().to_string();
                    error!(
                        "Step {} failed fatally, abandoning {} running steps",
                        step_id,
                        running.len()
                    );
                    running.detach_all();
                    return Err(ExecutionError::FatalStep { step_id, source });
                }
            }
        }

        match last_finished {
            Some(position) => runner.final_flush(&mut results[position]).await?,
            None => runner.run.store.flush(None).await?,
        }

        info!("Executed {} steps", steps.len());
        Ok(results)
    }
}

impl std::fmt::Debug for StepGraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraphExecutor")
            .field("steps", &self.graph.steps().len())
            .field("has_sink", &self.sink.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Decrements the in-degree of each dependent of a step that reached a
/// terminal status, queueing those with no unresolved dependency left.
fn release_dependents(
    graph: &StepGraph,
    step_id: &str,
    in_degrees: &mut [usize],
    ready: &mut VecDeque<usize>,
) {
    let mut dependents: Vec<usize> = graph
        .dependents_of(&StepId::new(step_id))
        .iter()
        .filter_map(|dependent| graph.position(dependent))
        .collect();
    dependents.sort_unstable();

    for dependent in dependents {
        in_degrees[dependent] -= 1;
        if in_degrees[dependent] == 0 {
            ready.push_back(dependent);
        }
    }
}

// =============================================================================
// STEP EXECUTION
// =============================================================================

enum StepOutcome {
    Finished(StepResult),
    Fatal(StepError),
}

struct StepRunner {
    run: Arc<RunResources>,
    sink: Option<Arc<dyn GraphObjectSink>>,
    hooks: Option<Arc<dyn ExecutionHooks>>,
    upload_concurrency: usize,
    step_permits: Option<Arc<Semaphore>>,
}

impl StepRunner {
    fn uploader(&self, step_id: &str) -> Option<Arc<UploadQueue>> {
        self.sink.as_ref().map(|sink| {
            Arc::new(UploadQueue::new(
                step_id,
                self.upload_concurrency,
                sink.clone(),
            ))
        })
    }

    async fn run_step(
        self: Arc<Self>,
        position: usize,
        step: Step,
        result: StepResult,
        start_state: StepStartState,
        dependency_failed: bool,
    ) -> (usize, StepOutcome) {
        let span = info_span!(
            "step",
            step.id = %step.id(),
            step.name = %step.metadata().name,
        );
        let outcome = self
            .execute_step(step, result, start_state, dependency_failed)
            .instrument(span)
            .await;
        (position, outcome)
    }

    async fn execute_step(
        &self,
        step: Step,
        mut result: StepResult,
        start_state: StepStartState,
        dependency_failed: bool,
    ) -> StepOutcome {
        let _permit = match &self.step_permits {
            Some(permits) => match permits.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    error!("Step semaphore closed unexpectedly");
                    None
                }
            },
            None => None,
        };

        let metadata = step.metadata();
        if let Some(hooks) = &self.hooks {
            hooks.before_execute_step(metadata).await;
        }

        let job_state = JobState::new(step.id(), self.run.clone(), self.uploader(step.id()));
        let start = Utc::now();
        info!("Starting step");

        let outcome = match &start_state.step_cache_path {
            Some(cache_path) => load_from_cache(&job_state, cache_path)
                .await
                .map(|()| StepResultStatus::Cached),
            None => {
                let ctx = StepExecutionContext {
                    step_id: metadata.id.clone(),
                    step_name: metadata.name.clone(),
                    job_state: job_state.clone(),
                    span: tracing::Span::current(),
                };
                match AssertUnwindSafe(step.run(ctx)).catch_unwind().await {
                    Ok(outcome) => outcome.map(|()| StepResultStatus::Success),
                    Err(panic) => Err(StepError::recoverable(format!(
                        "step handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            }
        };

        let mut status = match outcome {
            Ok(status) => status,
            Err(error) if error.is_fatal() => {
                error!("Step failed with fatal error: {}", error);
                if let Err(upload_error) = job_state.wait_until_uploads_complete().await {
                    error!("{}", upload_error);
                }
                return StepOutcome::Fatal(error);
            }
            Err(error) => {
                let error_id = Uuid::new_v4();
                error!(error_id = %error_id, "Step failed: {}", error);
                StepResultStatus::Failure
            }
        };

        let handler_succeeded = status != StepResultStatus::Failure;
        if status == StepResultStatus::Success && dependency_failed {
            warn!("A dependency of this step failed, its data may be incomplete");
            status = StepResultStatus::PartialSuccessDueToDependencyFailure;
        }

        if let Err(error) = job_state.flush().await {
            error!("Failed to flush step data: {}", error);
            status = StepResultStatus::Failure;
        }
        if let Err(error) = job_state.wait_until_uploads_complete().await {
            error!("{}", error);
            status = StepResultStatus::Failure;
            result.add_partial_types(error.failed_types());
        }

        result.status = status;
        result.record_timing(start, Utc::now());
        result.encountered_types = self.run.type_tracker.encountered_types_for_step(step.id());
        result.encountered_type_counts = self
            .run
            .type_tracker
            .summarize_step(step.id())
            .into_iter()
            .map(|(object_type, summary)| (object_type, summary.total))
            .collect();

        if handler_succeeded {
            let undeclared = undeclared_types(&result);
            if !undeclared.is_empty() {
                warn!("Step produced undeclared types: {:?}", undeclared);
            }
        }

        if let Some(hooks) = &self.hooks {
            hooks.after_execute_step(metadata, &result).await;
        }

        info!(
            status = %result.status,
            duration_ms = result.duration.unwrap_or_default(),
            "Step finished"
        );
        StepOutcome::Finished(result)
    }

    /// Flushes whatever is still buffered through the uploader of the last
    /// step to finish, charging upload failures to that step.
    async fn final_flush(&self, result: &mut StepResult) -> Result<()> {
        let uploader = self.uploader(&result.id);
        let job_state = JobState::new(&result.id, self.run.clone(), uploader);
        job_state.flush().await?;

        if let Err(error) = job_state.wait_until_uploads_complete().await {
            error!("Final upload failed: {}", error);
            result.status = StepResultStatus::Failure;
            result.add_partial_types(error.failed_types());
        }
        Ok(())
    }
}

/// Hydrates a step from the graph files a previous run wrote under `cache_path`.
async fn load_from_cache(job_state: &JobState, cache_path: &Path) -> std::result::Result<(), StepError> {
    info!("Loading step data from cache at {}", cache_path.display());

    let blobs = FileBlobStore::new(cache_path);
    let entities: Vec<Entity> = read_step_graph_files(&blobs, job_state.step_id()).await?;
    let relationships: Vec<Relationship> =
        read_step_graph_files(&blobs, job_state.step_id()).await?;

    info!(
        "Loaded {} entities and {} relationships from cache",
        entities.len(),
        relationships.len()
    );
    job_state.add_entities(entities).await?;
    job_state.add_relationships(relationships).await?;
    Ok(())
}

/// Encountered types the step did not declare.
fn undeclared_types(result: &StepResult) -> Vec<&str> {
    result
        .encountered_types
        .iter()
        .filter(|t| !result.declared_types.contains(t))
        .map(String::as_str)
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlushedGraphObjectData;
    use crate::executor::{build_step_dependency_graph, SinkError};
    use crate::storage::InMemoryGraphObjectStore;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn store() -> Arc<dyn GraphObjectStore> {
        Arc::new(InMemoryGraphObjectStore::new())
    }

    /// Sink that takes a while per batch and counts finished uploads.
    #[derive(Default)]
    struct SlowSink {
        uploaded: AtomicUsize,
    }

    #[async_trait]
    impl GraphObjectSink for SlowSink {
        async fn upload(
            &self,
            _step_id: &str,
            batch: &FlushedGraphObjectData,
        ) -> std::result::Result<(), SinkError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.uploaded.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_empty_graph() {
        let graph = build_step_dependency_graph(Vec::new()).unwrap();
        let results = execute_step_dependency_graph(graph, StepStartStates::new(), store())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_fails_only_that_step() {
        let graph = build_step_dependency_graph(vec![
            Step::new("a", "A").handler(|_ctx| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
            Step::new("b", "B"),
        ])
        .unwrap();

        let results = execute_step_dependency_graph(graph, StepStartStates::new(), store())
            .await
            .unwrap();

        assert_eq!(results[0].status, StepResultStatus::Failure);
        assert_eq!(results[1].status, StepResultStatus::Success);
    }

    #[tokio::test]
    async fn test_max_concurrent_steps_bounds_running_handlers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let steps = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                Step::new(format!("s{}", i), format!("Step {}", i)).handler(move |_ctx| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .collect();

        let results = StepGraphExecutor::new(build_step_dependency_graph(steps).unwrap(), store())
            .with_max_concurrent_steps(2)
            .execute()
            .await
            .unwrap();

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_in_memory_store_uploads_through_sink() {
        let sink = Arc::new(SlowSink::default());
        let graph = build_step_dependency_graph(vec![Step::new("users", "Users")
            .entity_type("acme_user")
            .handler(|ctx| async move {
                ctx.job_state
                    .add_entity(Entity::new("u1", "acme_user", "User"))
                    .await?;
                Ok(())
            })])
        .unwrap();

        let results = StepGraphExecutor::new(graph, store())
            .with_sink(sink.clone())
            .execute()
            .await
            .unwrap();

        assert_eq!(results[0].status, StepResultStatus::Success);
        assert_eq!(sink.uploaded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_step_drains_its_uploads_before_aborting() {
        let sink = Arc::new(SlowSink::default());
        let graph = build_step_dependency_graph(vec![Step::new("users", "Users")
            .entity_type("acme_user")
            .handler(|ctx| async move {
                ctx.job_state
                    .add_entities(vec![
                        Entity::new("u1", "acme_user", "User"),
                        Entity::new("u2", "acme_user", "User"),
                    ])
                    .await?;
                ctx.job_state.flush().await?;
                Err(StepError::fatal("credentials revoked"))
            })])
        .unwrap();

        let err = StepGraphExecutor::new(graph, store())
            .with_sink(sink.clone())
            .execute()
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::FatalStep { ref step_id, .. } if step_id == "users"));
        assert_eq!(sink.uploaded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_undeclared_types_warned_only_for_successful_handlers() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let graph = build_step_dependency_graph(vec![
            Step::new("failing", "Failing").handler(|ctx| async move {
                ctx.job_state
                    .add_entity(Entity::new("u1", "acme_user", "User"))
                    .await?;
                Err(StepError::from("upstream timeout"))
            }),
            Step::new("working", "Working").handler(|ctx| async move {
                ctx.job_state
                    .add_entity(Entity::new("g1", "acme_group", "Group"))
                    .await?;
                Ok(())
            }),
        ])
        .unwrap();

        let results = execute_step_dependency_graph(graph, StepStartStates::new(), store())
            .await
            .unwrap();
        assert_eq!(results[0].status, StepResultStatus::Failure);
        assert_eq!(results[0].encountered_types, vec!["acme_user"]);

        let warnings: Vec<String> = logs
            .lines()
            .into_iter()
            .filter(|line| line.contains("undeclared types"))
            .collect();
        assert_eq!(warnings.len(), 1, "{:?}", warnings);
        assert!(warnings[0].contains("acme_group"));
    }

    #[test]
    fn test_undeclared_types() {
        let mut result = StepResult::initial(
            &crate::core::StepMetadata::new("s", "S"),
            StepResultStatus::PendingEvaluation,
        );
        result.declared_types = vec!["acme_user".to_string()];
        result.encountered_types = vec!["acme_group".to_string(), "acme_user".to_string()];

        assert_eq!(undeclared_types(&result), vec!["acme_group"]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
