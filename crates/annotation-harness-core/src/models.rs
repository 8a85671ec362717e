//! Core data models for Annotation Harness.
//!
//! These types represent the datasets, records, and labeling rules that flow
//! through ingestion, search, export, and metric computation. Response
//! serialization omits absent optional fields (`skip_serializing_if`) so that
//! an undefined ratio or an unset precision is *absent* on the wire, never
//! `null` or `0`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of annotation tasks.
///
/// Each variant carries its own payload shape, annotation shape, and default
/// dataset settings; callers dispatch by matching on the task tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    TextClassification,
    TokenClassification,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextClassification => "TextClassification",
            TaskType::TokenClassification => "TokenClassification",
        }
    }

    /// Parse a task tag as it appears in a route path segment.
    pub fn parse(s: &str) -> Option<TaskType> {
        match s {
            "TextClassification" => Some(TaskType::TextClassification),
            "TokenClassification" => Some(TaskType::TokenClassification),
            _ => None,
        }
    }

    /// Settings a freshly created dataset of this task starts with.
    ///
    /// Both tasks start with an open label schema; a schema can be attached
    /// later through dataset settings.
    pub fn default_settings(&self) -> DatasetSettings {
        match self {
            TaskType::TextClassification | TaskType::TokenClassification => DatasetSettings {
                label_schema: None,
            },
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dataset identity: the `(workspace, name, task)` tuple is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub workspace: String,
    pub name: String,
    pub task: TaskType,
}

impl DatasetId {
    pub fn new(workspace: impl Into<String>, name: impl Into<String>, task: TaskType) -> Self {
        Self {
            workspace: workspace.into(),
            name: name.into(),
            task,
        }
    }

    /// Storage key used by index backends to address the dataset document.
    pub fn storage_key(&self) -> String {
        format!("{}.{}.{}", self.workspace, self.name, self.task)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.workspace, self.name, self.task)
    }
}

/// Optional dataset settings: currently the allowed label schema.
///
/// When `label_schema` is set, ingestion rejects records whose annotation or
/// prediction labels fall outside it, and rule creation rejects out-of-schema
/// target labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_schema: Option<Vec<String>>,
}

/// A named, versioned dataset. Labeling rules are persisted alongside the
/// dataset document itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub workspace: String,
    pub task: TaskType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<DatasetSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<LabelingRule>,
}

impl Dataset {
    pub fn id(&self) -> DatasetId {
        DatasetId::new(self.workspace.clone(), self.name.clone(), self.task)
    }

    /// Merge tags and metadata into the dataset, per-key last-write-wins.
    /// Existing keys not present in the update are kept.
    pub fn merge(
        &mut self,
        tags: &BTreeMap<String, String>,
        metadata: &BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) {
        for (k, v) in tags {
            self.tags.insert(k.clone(), v.clone());
        }
        for (k, v) in metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.updated_at = now;
    }
}

/// Task-specific record input, tagged by the task it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task")]
pub enum TaskPayload {
    TextClassification {
        text: String,
    },
    TokenClassification {
        text: String,
        tokens: Vec<String>,
    },
}

impl TaskPayload {
    pub fn task(&self) -> TaskType {
        match self {
            TaskPayload::TextClassification { .. } => TaskType::TextClassification,
            TaskPayload::TokenClassification { .. } => TaskType::TokenClassification,
        }
    }

    /// The searchable text of the payload.
    pub fn text(&self) -> &str {
        match self {
            TaskPayload::TextClassification { text } => text,
            TaskPayload::TokenClassification { text, .. } => text,
        }
    }
}

/// A class label with an optional confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLabel {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl ClassLabel {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            score: None,
        }
    }
}

/// A labeled token span within the payload text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// Task-specific annotation content: class labels for text classification,
/// entity spans for token classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Annotation {
    Labels { labels: Vec<ClassLabel> },
    Entities { entities: Vec<EntitySpan> },
}

impl Annotation {
    /// All label names asserted by this annotation.
    pub fn labels(&self) -> Vec<&str> {
        match self {
            Annotation::Labels { labels } => labels.iter().map(|l| l.class.as_str()).collect(),
            Annotation::Entities { entities } => {
                entities.iter().map(|e| e.label.as_str()).collect()
            }
        }
    }
}

/// A predicted annotation produced by an agent (a model or a rule runner),
/// with an optional overall score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub agent: String,
    #[serde(flatten)]
    pub annotation: Annotation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Record lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    #[default]
    Default,
    Validated,
    Discarded,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Default => "Default",
            RecordStatus::Validated => "Validated",
            RecordStatus::Discarded => "Discarded",
        }
    }
}

/// A single annotated/predicted record inside a dataset.
///
/// The caller-supplied `id` uniquely identifies the record within its
/// dataset; re-ingesting an id overwrites the stored record (idempotent
/// upsert). A record is *annotated* when it carries a validated human
/// [`Annotation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Record {
    pub fn task(&self) -> TaskType {
        self.payload.task()
    }

    pub fn text(&self) -> &str {
        self.payload.text()
    }

    /// Whether the record carries a validated human annotation.
    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }

    /// Labels asserted by the validated annotation, empty when unannotated.
    pub fn annotated_labels(&self) -> Vec<&str> {
        self.annotation.as_ref().map(|a| a.labels()).unwrap_or_default()
    }

    /// Labels asserted by any prediction.
    pub fn predicted_labels(&self) -> Vec<&str> {
        self.predictions
            .iter()
            .flat_map(|p| p.annotation.labels())
            .collect()
    }
}

/// A weak-supervision labeling rule, identified within its dataset by the
/// exact `query` string. The query is the rule's immutable identity; updates
/// may only touch `labels` and `description`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelingRule {
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one bulk ingestion call.
///
/// `processed` counts records written to the index, `failed` counts
/// per-record write failures. Validation failures never appear here: they
/// abort the batch before any write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    pub dataset: String,
    pub processed: usize,
    pub failed: usize,
}

/// Metrics for a single labeling rule, computed on demand from live index
/// state.
///
/// Ratios are `None` when their denominator is zero (undefined, not 0), and
/// the precision fields are unset when the rule asserts no target labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMetrics {
    pub total_records: u64,
    pub annotated_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_annotated: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incorrect: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
}

/// Aggregate metrics over all of a dataset's rules.
///
/// Coverage is computed over the *union* of the rules' matched sets, and
/// precision is the per-rule precision weighted by each rule's
/// annotated-matched count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRulesMetrics {
    pub total_records: u64,
    pub annotated_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_annotated: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
}

/// Per-facet aggregations attached to a search response when the caller
/// opts in with `include_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchAggregations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotated_as: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub predicted_as: BTreeMap<String, u64>,
}
