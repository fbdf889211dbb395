//! Hooks around graph object writes and step execution.

use super::error::BoxError;
use crate::core::{Entity, Relationship, StepMetadata, StepResult};
use async_trait::async_trait;

/// Sees every entity a step adds, before and after it reaches the store.
///
/// `before_add` may rewrite the entity or reject it; a rejection fails the
/// `add_entities` call that carried it.
pub trait EntityInterceptor: Send + Sync {
    fn before_add(&self, _step_id: &str, entity: Entity) -> Result<Entity, BoxError> {
        Ok(entity)
    }

    fn after_add(&self, _step_id: &str, _entity: &Entity) {}
}

/// Relationship counterpart of [`EntityInterceptor`].
pub trait RelationshipInterceptor: Send + Sync {
    fn before_add(&self, _step_id: &str, relationship: Relationship) -> Result<Relationship, BoxError> {
        Ok(relationship)
    }

    fn after_add(&self, _step_id: &str, _relationship: &Relationship) {}
}

/// Run-level callbacks around each executed step.
///
/// Disabled steps are skipped without calling either hook.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn before_execute_step(&self, _step: &StepMetadata) {}

    async fn after_execute_step(&self, _step: &StepMetadata, _result: &StepResult) {}
}
