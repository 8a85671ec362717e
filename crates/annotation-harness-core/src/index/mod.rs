//! Index collaborator contract.
//!
//! The [`RecordIndex`] trait defines every read/write operation the
//! record-management core needs from its search index, enabling pluggable
//! backends (SQLite, in-memory). Implementations must be `Send + Sync`, must
//! enforce dataset identity uniqueness on create, and must keep record
//! upserts idempotent by record id.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`find_dataset`](RecordIndex::find_dataset) | Resolve a dataset by identity |
//! | [`create_dataset`](RecordIndex::create_dataset) | Create; fails on identity collision |
//! | [`update_dataset`](RecordIndex::update_dataset) | Overwrite the dataset document |
//! | [`upsert_records`](RecordIndex::upsert_records) | Idempotent per-record upsert with per-record outcome |
//! | [`count`](RecordIndex::count) | Count records matching a query |
//! | [`search`](RecordIndex::search) | Paged search with optional aggregations |
//! | [`scan`](RecordIndex::scan) | Search-after scan page, ordered by record id |
//! | [`release_scan`](RecordIndex::release_scan) | Free server-side scan state |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::models::{Dataset, DatasetId, Record, SearchAggregations};
use crate::query::RecordQuery;

/// Sortable record fields accepted by [`RecordIndex::search`].
pub const SORTABLE_FIELDS: &[&str] = &["id", "status", "event_timestamp", "last_updated"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One sort key of a search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }
}

/// Per-record write outcome of a bulk upsert. A failed record carries the
/// backend's reason and does not abort the rest of the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordOutcome {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(reason.into()),
        }
    }
}

/// One page of a search response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchPage {
    pub total: u64,
    pub records: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SearchAggregations>,
}

/// One page of a search-after scan.
///
/// `cursor` is the opaque continuation token of a live server-side scan:
/// pass it back as `after` to fetch the next page, or hand it to
/// [`RecordIndex::release_scan`] to terminate early. A `None` cursor means
/// the scan is exhausted and the backend has already freed its state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub records: Vec<Record>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait RecordIndex: Send + Sync {
    /// Resolve a dataset by its identity tuple.
    async fn find_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>, IndexError>;

    /// Create a dataset. Fails with [`IndexError::DatasetExists`] when the
    /// identity tuple is already taken; the index is the sole enforcer of
    /// identity uniqueness.
    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), IndexError>;

    /// Overwrite the stored dataset document (tags, metadata, settings,
    /// rules, timestamps).
    async fn update_dataset(&self, dataset: &Dataset) -> Result<(), IndexError>;

    /// Upsert records keyed by id, reporting a per-record outcome. A
    /// failing record never aborts the remainder of the batch.
    async fn upsert_records(
        &self,
        id: &DatasetId,
        records: &[Record],
    ) -> Result<Vec<RecordOutcome>, IndexError>;

    /// Count records matching `query`.
    async fn count(&self, id: &DatasetId, query: &RecordQuery) -> Result<u64, IndexError>;

    /// Paged search. `sort` fields are drawn from [`SORTABLE_FIELDS`];
    /// aggregations are computed only when `want_metrics` is set.
    async fn search(
        &self,
        id: &DatasetId,
        query: &RecordQuery,
        sort: &[SortField],
        from: usize,
        limit: usize,
        want_metrics: bool,
    ) -> Result<SearchPage, IndexError>;

    /// Fetch one scan page ordered by record id, positioned after `after`:
    /// either a cursor from a previous page or a plain record id to start
    /// from (exclusive). `None` starts from the beginning.
    async fn scan(
        &self,
        id: &DatasetId,
        query: &RecordQuery,
        after: Option<&str>,
        page_size: usize,
    ) -> Result<ScanPage, IndexError>;

    /// Release a live scan cursor. Unknown cursors are an error; cursors of
    /// exhausted scans are released by the backend itself.
    async fn release_scan(&self, cursor: &str) -> Result<(), IndexError>;
}
