//! Bounded, per-step upload of flushed graph objects.
//!
//! Each running step gets its own [`UploadQueue`]. The store hands it every
//! batch it flushes (through [`FlushListener`]); the queue forwards batches
//! to the run's [`GraphObjectSink`] with at most `concurrency` uploads in
//! flight. The step is not finished until
//! [`UploadQueue::wait_until_uploads_complete`] has drained the queue.

use super::error::{SinkError, UploadError, UploadQueueError};
use crate::core::{retry_with_policy, Entity, FlushedGraphObjectData, Relationship, RetryPolicy};
use crate::storage::FlushListener;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn, Instrument};

/// Destination for flushed graph objects.
#[async_trait]
pub trait GraphObjectSink: Send + Sync {
    async fn upload(&self, step_id: &str, batch: &FlushedGraphObjectData)
        -> Result<(), SinkError>;
}

/// Retries transient sink failures under a [`RetryPolicy`].
pub struct RetryingSink {
    inner: Arc<dyn GraphObjectSink>,
    policy: RetryPolicy,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn GraphObjectSink>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl GraphObjectSink for RetryingSink {
    async fn upload(
        &self,
        step_id: &str,
        batch: &FlushedGraphObjectData,
    ) -> Result<(), SinkError> {
        retry_with_policy(self.policy, |_attempt| self.inner.upload(step_id, batch)).await
    }
}

pub struct UploadQueue {
    step_id: String,
    sink: Arc<dyn GraphObjectSink>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    completed: AtomicBool,
    failures: Arc<Mutex<Vec<UploadError>>>,
}

impl UploadQueue {
    pub fn new(step_id: impl Into<String>, concurrency: usize, sink: Arc<dyn GraphObjectSink>) -> Self {
        Self {
            step_id: step_id.into(),
            sink,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
            completed: AtomicBool::new(false),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// True once the queue has drained and stopped accepting batches.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Submits a batch for upload.
    ///
    /// Waits for a free slot when `concurrency` uploads are already in
    /// flight. Batches arriving after the queue completed are dropped.
    pub async fn enqueue(&self, batch: FlushedGraphObjectData) {
        if batch.is_empty() {
            return;
        }
        if self.is_completed() {
            debug!(
                "Upload queue for step {} already completed, dropping {} objects",
                self.step_id,
                batch.len()
            );
            return;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                debug!("Upload queue for step {} is full, waiting", self.step_id);
                match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            }
            Err(TryAcquireError::Closed) => return,
        };

        let sink = self.sink.clone();
        let failures = self.failures.clone();
        let step_id = self.step_id.clone();
        let span = tracing::debug_span!("upload", step.id = %step_id, objects = batch.len());

        self.tracker.spawn(
            async move {
                let _permit = permit;
                if let Err(source) = sink.upload(&step_id, &batch).await {
                    let error = UploadError {
                        step_id,
                        object_types: batch.object_types(),
                        source,
                    };
                    warn!("{}", error);
                    failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(error);
                }
            }
            .instrument(span),
        );
    }

    /// Waits for every in-flight upload, then marks the queue completed.
    ///
    /// Returns every failure collected since the last call.
    pub async fn wait_until_uploads_complete(&self) -> Result<(), UploadQueueError> {
        self.tracker.close();
        self.tracker.wait().await;
        self.completed.store(true, Ordering::SeqCst);

        let failures = std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(UploadQueueError {
                step_id: self.step_id.clone(),
                failures,
            })
        }
    }
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("step_id", &self.step_id)
            .field("in_flight", &self.tracker.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[async_trait]
impl FlushListener for UploadQueue {
    async fn entities_flushed(&self, entities: Vec<Arc<Entity>>) {
        self.enqueue(FlushedGraphObjectData::entities(entities)).await;
    }

    async fn relationships_flushed(&self, relationships: Vec<Arc<Relationship>>) {
        self.enqueue(FlushedGraphObjectData::relationships(relationships))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSink {
        uploads: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_type: Option<String>,
        transient_failures: AtomicUsize,
    }

    #[async_trait]
    impl GraphObjectSink for CountingSink {
        async fn upload(
            &self,
            _step_id: &str,
            batch: &FlushedGraphObjectData,
        ) -> Result<(), SinkError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.uploads.fetch_add(1, Ordering::SeqCst);

            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::transient("503"));
            }
            match &self.fail_type {
                Some(t) if batch.object_types().contains(t) => Err(SinkError::permanent("400")),
                _ => Ok(()),
            }
        }
    }

    fn batch(object_type: &str) -> FlushedGraphObjectData {
        FlushedGraphObjectData::entities(vec![Arc::new(Entity::new("k", object_type, "Thing"))])
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let sink = Arc::new(CountingSink::default());
        let queue = UploadQueue::new("s", 2, sink.clone());

        for _ in 0..8 {
            queue.enqueue(batch("t")).await;
        }
        queue.wait_until_uploads_complete().await.unwrap();

        assert_eq!(sink.uploads.load(Ordering::SeqCst), 8);
        assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(queue.is_completed());
    }

    #[tokio::test]
    async fn test_failures_are_collected_with_types() {
        let sink = Arc::new(CountingSink {
            fail_type: Some("bad".into()),
            ..Default::default()
        });
        let queue = UploadQueue::new("s", 4, sink);

        queue.enqueue(batch("good")).await;
        queue.enqueue(batch("bad")).await;

        let error = queue.wait_until_uploads_complete().await.unwrap_err();
        assert_eq!(error.step_id, "s");
        assert_eq!(error.failed_types(), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_enqueue_after_completion_is_dropped() {
        let sink = Arc::new(CountingSink::default());
        let queue = UploadQueue::new("s", 1, sink.clone());

        queue.wait_until_uploads_complete().await.unwrap();
        queue.enqueue(batch("t")).await;
        queue.wait_until_uploads_complete().await.unwrap();

        assert_eq!(sink.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_forwards_flushed_objects() {
        let sink = Arc::new(CountingSink::default());
        let queue = UploadQueue::new("s", 1, sink.clone());

        queue
            .entities_flushed(vec![Arc::new(Entity::new("k", "t", "Thing"))])
            .await;
        queue.relationships_flushed(Vec::new()).await;
        queue.wait_until_uploads_complete().await.unwrap();

        assert_eq!(sink.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_sink_recovers_from_transient_failures() {
        let sink = Arc::new(CountingSink {
            transient_failures: AtomicUsize::new(2),
            ..Default::default()
        });
        let retrying = RetryingSink::new(sink.clone(), RetryPolicy::STANDARD);

        retrying.upload("s", &batch("t")).await.unwrap();
        assert_eq!(sink.uploads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_sink_gives_up_on_permanent_failure() {
        let sink = Arc::new(CountingSink {
            fail_type: Some("t".into()),
            ..Default::default()
        });
        let retrying = RetryingSink::new(sink.clone(), RetryPolicy::STANDARD);

        assert!(retrying.upload("s", &batch("t")).await.is_err());
        assert_eq!(sink.uploads.load(Ordering::SeqCst), 1);
    }
}
