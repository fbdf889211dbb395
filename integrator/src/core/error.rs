use thiserror::Error;

/// Core error type for the integrator runtime.
///
/// Covers the encode/decode boundary shared by every layer that persists or
/// exchanges graph data (blob files, the step data store, summaries).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value to JSON.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding JSON bytes to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
