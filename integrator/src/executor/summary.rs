use crate::core::{deserialize_value, serialize_value_pretty, StepResult};
use crate::storage::{self, BlobStore, SUMMARY_FILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Types whose data is incomplete for this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDatasets {
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetadata {
    pub partial_datasets: PartialDatasets,
}

/// What a run reports when it finishes, persisted as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub integration_step_results: Vec<StepResult>,
    pub metadata: SummaryMetadata,
}

impl ExecutionSummary {
    /// Every declared type of a failed (or dependency-failed) step is
    /// partial; other steps contribute only their own partial types.
    pub fn from_results(results: Vec<StepResult>) -> Self {
        let mut types = BTreeSet::new();
        for result in &results {
            types.extend(result.partial_types.iter().cloned());
            if result.status.is_failure_like() {
                types.extend(result.declared_types.iter().cloned());
            }
        }

        Self {
            integration_step_results: results,
            metadata: SummaryMetadata {
                partial_datasets: PartialDatasets {
                    types: types.into_iter().collect(),
                },
            },
        }
    }

    pub fn partial_types(&self) -> &[String] {
        &self.metadata.partial_datasets.types
    }

    pub async fn write_to(&self, blobs: &dyn BlobStore) -> storage::Result<()> {
        let bytes = serialize_value_pretty(self)?;
        blobs.write(SUMMARY_FILE, &bytes).await
    }

    /// Reads a summary written by [`ExecutionSummary::write_to`].
    pub async fn read_from(blobs: &dyn BlobStore) -> storage::Result<Self> {
        let bytes = blobs.read(SUMMARY_FILE).await?;
        Ok(deserialize_value(&bytes)?)
    }
}
