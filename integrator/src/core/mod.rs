//! Core types shared by every layer of the integrator runtime.
//!
//! # Domain Model
//! - [`Entity`] / [`Relationship`]: immutable graph objects produced by steps
//! - [`StepMetadata`]: static step configuration (declared types, dependencies)
//! - [`StepResult`] / [`StepResultStatus`]: what the scheduler reports per step
//! - [`StepStartState`]: enabled, disabled or hydrated from a cache
//!
//! # Collections
//! - [`BigMap`]: a sharded map for key spaces in the millions
//!
//! # Serialization
//! - [`serialize_value`] / [`deserialize_value`]: JSON encode/decode with [`CoreError`]
//! - [`serialized_size`]: byte size of a value's JSON encoding
//!
//! # Retry Behavior
//! - [`RetryPolicy`] and [`Retryable`]: backoff configuration and error classification
//! - [`retry_with_policy`]: drives an async operation under a policy

mod big_map;
mod error;
mod object;
pub mod retry;
mod serialization;
mod step;

pub use big_map::BigMap;
pub use error::{CoreError, Result};
pub use object::{
    Entity, FlushedGraphObjectData, GraphObject, GraphObjectClass, GraphObjectFilter, Relationship,
    ENTITY_RESERVED_PROPERTIES, RELATIONSHIP_RESERVED_PROPERTIES,
};
pub use retry::{retry_with_policy, RetryPolicy, Retryable};
pub use serialization::{
    deserialize_value, serialize_value, serialize_value_pretty, serialized_size,
};
pub use step::{
    IndexMetadata, StepGraphObjectMetadata, StepMetadata, StepResult, StepResultStatus,
    StepStartState, StepStartStates,
};
