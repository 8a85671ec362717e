//! Error taxonomy shared by all components.
//!
//! Collaborator errors ([`IndexError`]) propagate unmodified through the
//! core; the one deliberate exception is the absent-dataset probe during
//! ingestion, which turns into the dataset-creation path instead of
//! surfacing. Undefined ratios are never errors — they are absent fields on
//! the metric types.

use serde::Serialize;
use thiserror::Error;

/// A record rejected by batch validation, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidRecord {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("dataset `{0}` not found")]
    DatasetNotFound(String),

    #[error("no labeling rule found for query `{0}`")]
    RuleNotFound(String),

    #[error("a labeling rule for query `{0}` already exists")]
    RuleConflict(String),

    /// Schema validation failed for the whole batch; nothing was written.
    #[error("validation failed for {} record(s) in dataset `{dataset}`", records.len())]
    Validation {
        dataset: String,
        records: Vec<InvalidRecord>,
    },

    #[error("invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("unsortable field `{0}`")]
    InvalidSort(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Errors surfaced by an index backend.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Identity-uniqueness violation on dataset creation. The ingestion
    /// coordinator degrades this into an update of the winning dataset.
    #[error("dataset `{0}` already exists")]
    DatasetExists(String),

    #[error("scan cursor `{0}` is not open")]
    UnknownCursor(String),

    #[error("index backend error: {0}")]
    Backend(String),
}

impl IndexError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        IndexError::Backend(err.to_string())
    }
}
