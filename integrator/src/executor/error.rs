use crate::core::{CoreError, Retryable};
use crate::graph::GraphError;
use crate::storage::StorageError;
use crate::tracking::DuplicateKeyError;
use thiserror::Error;

/// Boxed error used at the boundary with user code (handlers, sinks, interceptors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Execution layer error type.
///
/// Only structural failures (graph construction, fatal step errors, final
/// flush) reach the caller of the scheduler. Everything else is absorbed
/// into per-step results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Graph construction or evaluation failed (cycle, missing dependency, ...).
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A `_key` was registered twice in the run.
    #[error(transparent)]
    DuplicateKey(#[from] DuplicateKeyError),

    /// `get_entity` found nothing under the key.
    #[error("entity not found: _key={key}")]
    EntityNotFound { key: String },

    /// An interceptor refused a graph object.
    #[error("interceptor rejected _key={key}")]
    Rejected {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Uploads for a step failed.
    #[error(transparent)]
    Upload(#[from] UploadQueueError),

    /// A step failed with a fatal error and the run was aborted.
    #[error("step '{step_id}' failed fatally: {source}")]
    FatalStep {
        step_id: String,
        #[source]
        source: StepError,
    },

    /// A scheduler task panicked outside of a step handler.
    #[error("task panicked: {0}")]
    TaskPanic(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

// =============================================================================
// STEP ERRORS
// =============================================================================

/// Whether a handler error stops the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The step is marked `FAILURE`; independent steps keep running.
    Recoverable,
    /// The scheduler stops submitting work and returns the error.
    Fatal,
}

/// Error returned by a step handler.
///
/// ```
/// use integrator::executor::{ErrorKind, StepError};
///
/// let recoverable: StepError = "upstream returned 503".into();
/// assert_eq!(recoverable.kind(), ErrorKind::Recoverable);
///
/// let fatal = StepError::fatal("credentials revoked");
/// assert!(fatal.is_fatal());
/// ```
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StepError {
    kind: ErrorKind,
    #[source]
    source: BoxError,
}

impl StepError {
    pub fn new(kind: ErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn recoverable(source: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Recoverable, source)
    }

    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Fatal, source)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

impl From<ExecutionError> for StepError {
    fn from(error: ExecutionError) -> Self {
        Self::recoverable(error)
    }
}

impl From<StorageError> for StepError {
    fn from(error: StorageError) -> Self {
        Self::recoverable(error)
    }
}

impl From<CoreError> for StepError {
    fn from(error: CoreError) -> Self {
        Self::recoverable(error)
    }
}

impl From<DuplicateKeyError> for StepError {
    fn from(error: DuplicateKeyError) -> Self {
        Self::recoverable(error)
    }
}

impl From<std::io::Error> for StepError {
    fn from(error: std::io::Error) -> Self {
        Self::recoverable(error)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(error: serde_json::Error) -> Self {
        Self::recoverable(error)
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::recoverable(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::recoverable(message)
    }
}

// =============================================================================
// UPLOAD ERRORS
// =============================================================================

/// Error reported by a [`super::GraphObjectSink`].
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SinkError {
    retryable: bool,
    #[source]
    source: BoxError,
}

impl SinkError {
    /// A failure worth retrying (timeouts, throttling, 5xx).
    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self {
            retryable: true,
            source: source.into(),
        }
    }

    /// A failure that will not go away on retry (payload rejected, unauthorized).
    pub fn permanent(source: impl Into<BoxError>) -> Self {
        Self {
            retryable: false,
            source: source.into(),
        }
    }
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// One failed batch.
#[derive(Debug, Error)]
#[error("upload of {object_types:?} for step '{step_id}' failed: {source}")]
pub struct UploadError {
    pub step_id: String,
    /// The `_type`s in the failed batch.
    pub object_types: Vec<String>,
    #[source]
    pub source: SinkError,
}

/// Every batch that failed for one step.
#[derive(Debug, Error)]
#[error("{} upload(s) failed for step '{step_id}'", failures.len())]
pub struct UploadQueueError {
    pub step_id: String,
    pub failures: Vec<UploadError>,
}

impl UploadQueueError {
    /// The `_type`s whose data may be incomplete remotely, sorted.
    pub fn failed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .failures
            .iter()
            .flat_map(|f| f.object_types.iter().cloned())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_conversions_are_recoverable() {
        let from_str: StepError = "boom".into();
        let from_io: StepError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        let from_exec: StepError = ExecutionError::EntityNotFound { key: "k".into() }.into();

        assert_eq!(from_str.kind(), ErrorKind::Recoverable);
        assert_eq!(from_io.kind(), ErrorKind::Recoverable);
        assert_eq!(from_exec.to_string(), "entity not found: _key=k");
    }

    #[test]
    fn test_fatal_step_error() {
        let error = StepError::fatal("stop");
        assert!(error.is_fatal());
        assert_eq!(error.to_string(), "stop");
    }

    #[test]
    fn test_failed_types_are_sorted_and_deduped() {
        let failure = |types: &[&str]| UploadError {
            step_id: "s".into(),
            object_types: types.iter().map(|t| t.to_string()).collect(),
            source: SinkError::permanent("rejected"),
        };
        let error = UploadQueueError {
            step_id: "s".into(),
            failures: vec![failure(&["b", "a"]), failure(&["a", "c"])],
        };

        assert_eq!(error.failed_types(), vec!["a", "b", "c"]);
        assert_eq!(error.to_string(), "2 upload(s) failed for step 's'");
    }
}
