use crate::core::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Uploads in flight per step before `enqueue` starts waiting.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 6;

/// Tunables for [`super::StepGraphExecutor`].
///
/// ```
/// use integrator::core::RetryPolicy;
/// use integrator::executor::ExecutorConfig;
///
/// let config: ExecutorConfig = serde_json::from_str(r#"{ "maxConcurrentSteps": 4 }"#).unwrap();
/// assert_eq!(config.max_concurrent_steps, Some(4));
/// assert_eq!(config.upload_concurrency, 6);
///
/// let config = ExecutorConfig::default().with_upload_retry(RetryPolicy::NONE);
/// assert_eq!(config.upload_retry.max_attempts, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Steps running at once. `None` means unbounded.
    pub max_concurrent_steps: Option<usize>,
    pub upload_concurrency: usize,
    pub upload_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: None,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            upload_retry: RetryPolicy::STANDARD,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrent_steps(mut self, limit: usize) -> Self {
        self.max_concurrent_steps = Some(limit.max(1));
        self
    }

    pub fn with_upload_concurrency(mut self, limit: usize) -> Self {
        self.upload_concurrency = limit.max(1);
        self
    }

    pub fn with_upload_retry(mut self, policy: RetryPolicy) -> Self {
        self.upload_retry = policy;
        self
    }
}
