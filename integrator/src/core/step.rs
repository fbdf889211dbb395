//! Step configuration and per-step results.
//!
//! `StepMetadata` is the static description of a step: its id, the graph
//! object types it declares and the steps it depends on. `StepResult` is what
//! the scheduler reports back for every step, whether or not it ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Durable indexing policy for one declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// When false, objects of this type are uploaded but never written to disk.
    pub enabled: bool,
}

impl Default for IndexMetadata {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A declared entity or relationship type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepGraphObjectMetadata {
    #[serde(rename = "_type")]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_metadata: Option<IndexMetadata>,
}

impl StepGraphObjectMetadata {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            partial: false,
            index_metadata: None,
        }
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn with_index_metadata(mut self, index_metadata: IndexMetadata) -> Self {
        self.index_metadata = Some(index_metadata);
        self
    }
}

/// Static configuration of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entities: Vec<StepGraphObjectMetadata>,
    #[serde(default)]
    pub relationships: Vec<StepGraphObjectMetadata>,
    #[serde(default)]
    pub mapped_relationships: Vec<StepGraphObjectMetadata>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    fn all_declared(&self) -> impl Iterator<Item = &StepGraphObjectMetadata> {
        self.entities
            .iter()
            .chain(self.relationships.iter())
            .chain(self.mapped_relationships.iter())
    }

    /// Every declared `_type`, in declaration order.
    pub fn declared_types(&self) -> Vec<String> {
        self.all_declared()
            .map(|meta| meta.object_type.clone())
            .collect()
    }

    /// Declared types marked `partial`.
    pub fn partial_types(&self) -> Vec<String> {
        self.all_declared()
            .filter(|meta| meta.partial)
            .map(|meta| meta.object_type.clone())
            .collect()
    }

    /// Indexing policy for a declared type, if one was configured.
    pub fn index_metadata_for(&self, object_type: &str) -> Option<IndexMetadata> {
        self.all_declared()
            .find(|meta| meta.object_type == object_type)
            .and_then(|meta| meta.index_metadata)
    }
}

/// Status of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResultStatus {
    PendingEvaluation,
    Success,
    Failure,
    PartialSuccessDueToDependencyFailure,
    Cached,
    Disabled,
}

impl StepResultStatus {
    /// True for the statuses whose data dependents cannot fully trust.
    pub fn is_failure_like(self) -> bool {
        matches!(
            self,
            StepResultStatus::Failure | StepResultStatus::PartialSuccessDueToDependencyFailure
        )
    }
}

impl std::fmt::Display for StepResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepResultStatus::PendingEvaluation => "PENDING_EVALUATION",
            StepResultStatus::Success => "SUCCESS",
            StepResultStatus::Failure => "FAILURE",
            StepResultStatus::PartialSuccessDueToDependencyFailure => {
                "PARTIAL_SUCCESS_DUE_TO_DEPENDENCY_FAILURE"
            }
            StepResultStatus::Cached => "CACHED",
            StepResultStatus::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: String,
    pub name: String,
    pub declared_types: Vec<String>,
    pub partial_types: Vec<String>,
    pub encountered_types: Vec<String>,
    #[serde(default)]
    pub encountered_type_counts: BTreeMap<String, u64>,
    pub status: StepResultStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between `start_time` and `end_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl StepResult {
    /// Creates the initial result for a step.
    pub fn initial(metadata: &StepMetadata, status: StepResultStatus) -> Self {
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            declared_types: metadata.declared_types(),
            partial_types: metadata.partial_types(),
            encountered_types: Vec::new(),
            encountered_type_counts: BTreeMap::new(),
            status,
            depends_on: metadata.depends_on.clone(),
            start_time: None,
            end_time: None,
            duration: None,
        }
    }

    /// Records the timing of a step that actually ran.
    pub fn record_timing(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self.duration = Some((end - start).num_milliseconds());
    }

    /// Adds partial types, keeping the list sorted and free of duplicates.
    pub fn add_partial_types<I>(&mut self, types: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.partial_types.extend(types);
        self.partial_types.sort();
        self.partial_types.dedup();
    }
}

/// How a step begins a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStartState {
    pub disabled: bool,
    /// Root of a previous run's storage to hydrate this step from instead of
    /// running its handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_cache_path: Option<std::path::PathBuf>,
}

impl StepStartState {
    pub fn enabled() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            disabled: true,
            step_cache_path: None,
        }
    }

    pub fn cached(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            disabled: false,
            step_cache_path: Some(path.into()),
        }
    }
}

/// Start states keyed by step id. Steps missing from the map start enabled.
pub type StepStartStates = HashMap<String, StepStartState>;
