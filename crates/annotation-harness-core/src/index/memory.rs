//! In-memory [`RecordIndex`] implementation for tests.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`; query matching is
//! the reference implementation from [`crate::query`]. Open scan cursors are
//! tracked so tests can assert that exports never leak them, and the
//! `fail_record_write` / `fail_scans_after` switches simulate the partial
//! failures the coordinator and export pipeline must tolerate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::IndexError;
use crate::models::{Dataset, DatasetId, Record, SearchAggregations};
use crate::query::RecordQuery;

use super::{RecordIndex, RecordOutcome, ScanPage, SearchPage, SortField, SortOrder};

struct ScanState {
    dataset_key: String,
    position: String,
}

/// In-memory index backend.
pub struct MemoryIndex {
    datasets: RwLock<HashMap<String, Dataset>>,
    records: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    cursors: RwLock<HashMap<String, ScanState>>,
    failing_ids: RwLock<HashSet<String>>,
    scans_until_failure: RwLock<Option<u32>>,
    max_record_bytes: Option<usize>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
            failing_ids: RwLock::new(HashSet::new()),
            scans_until_failure: RwLock::new(None),
            max_record_bytes: None,
        }
    }

    /// Reject records whose serialized form exceeds `bytes`, reporting them
    /// as per-record write failures.
    pub fn with_max_record_bytes(bytes: usize) -> Self {
        Self {
            max_record_bytes: Some(bytes),
            ..Self::new()
        }
    }

    /// Make every upsert of `id` fail with a per-record write error.
    pub fn fail_record_write(&self, id: impl Into<String>) {
        self.failing_ids.write().unwrap().insert(id.into());
    }

    /// Let `n` scan calls succeed, then fail every one after that.
    pub fn fail_scans_after(&self, n: u32) {
        *self.scans_until_failure.write().unwrap() = Some(n);
    }

    /// Number of scan cursors currently held open.
    pub fn open_cursors(&self) -> usize {
        self.cursors.read().unwrap().len()
    }

    fn check_scan_poison(&self) -> Result<(), IndexError> {
        let mut guard = self.scans_until_failure.write().unwrap();
        if let Some(remaining) = guard.as_mut() {
            if *remaining == 0 {
                return Err(IndexError::Backend("scan failed".to_string()));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &Record, b: &Record, sort: &[SortField]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for key in sort {
        let ord = match key.field.as_str() {
            "id" => a.id.cmp(&b.id),
            "status" => a.status.as_str().cmp(b.status.as_str()),
            "event_timestamp" => a.event_timestamp.cmp(&b.event_timestamp),
            "last_updated" => a.last_updated.cmp(&b.last_updated),
            _ => Ordering::Equal,
        };
        let ord = match key.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn aggregate(records: &[&Record]) -> SearchAggregations {
    let mut metrics = SearchAggregations::default();
    for record in records {
        *metrics
            .status
            .entry(record.status.as_str().to_string())
            .or_insert(0) += 1;
        for label in record.annotated_labels() {
            *metrics.annotated_as.entry(label.to_string()).or_insert(0) += 1;
        }
        for label in record.predicted_labels() {
            *metrics.predicted_as.entry(label.to_string()).or_insert(0) += 1;
        }
    }
    metrics
}

#[async_trait]
impl RecordIndex for MemoryIndex {
    async fn find_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>, IndexError> {
        Ok(self.datasets.read().unwrap().get(&id.storage_key()).cloned())
    }

    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), IndexError> {
        let key = dataset.id().storage_key();
        let mut datasets = self.datasets.write().unwrap();
        if datasets.contains_key(&key) {
            return Err(IndexError::DatasetExists(key));
        }
        datasets.insert(key, dataset.clone());
        Ok(())
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<(), IndexError> {
        self.datasets
            .write()
            .unwrap()
            .insert(dataset.id().storage_key(), dataset.clone());
        Ok(())
    }

    async fn upsert_records(
        &self,
        id: &DatasetId,
        records: &[Record],
    ) -> Result<Vec<RecordOutcome>, IndexError> {
        let key = id.storage_key();
        let failing = self.failing_ids.read().unwrap();
        let mut store = self.records.write().unwrap();
        let dataset_records = store.entry(key).or_default();

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            if failing.contains(&record.id) {
                outcomes.push(RecordOutcome::failed(&record.id, "write rejected"));
                continue;
            }
            if let Some(max) = self.max_record_bytes {
                let size = serde_json::to_vec(record)
                    .map_err(IndexError::backend)?
                    .len();
                if size > max {
                    outcomes.push(RecordOutcome::failed(
                        &record.id,
                        format!("record exceeds maximum size of {} bytes", max),
                    ));
                    continue;
                }
            }
            dataset_records.insert(record.id.clone(), record.clone());
            outcomes.push(RecordOutcome::ok(&record.id));
        }
        Ok(outcomes)
    }

    async fn count(&self, id: &DatasetId, query: &RecordQuery) -> Result<u64, IndexError> {
        let store = self.records.read().unwrap();
        let count = store
            .get(&id.storage_key())
            .map(|records| records.values().filter(|r| query.matches(r)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn search(
        &self,
        id: &DatasetId,
        query: &RecordQuery,
        sort: &[SortField],
        from: usize,
        limit: usize,
        want_metrics: bool,
    ) -> Result<SearchPage, IndexError> {
        let store = self.records.read().unwrap();
        let empty = BTreeMap::new();
        let records = store.get(&id.storage_key()).unwrap_or(&empty);

        let mut matched: Vec<&Record> = records.values().filter(|r| query.matches(r)).collect();
        matched.sort_by(|a, b| compare(a, b, sort));

        let metrics = want_metrics.then(|| aggregate(&matched));
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(from)
            .take(limit)
            .cloned()
            .collect();

        Ok(SearchPage {
            total,
            records: page,
            metrics,
        })
    }

    async fn scan(
        &self,
        id: &DatasetId,
        query: &RecordQuery,
        after: Option<&str>,
        page_size: usize,
    ) -> Result<ScanPage, IndexError> {
        self.check_scan_poison()?;
        let key = id.storage_key();

        // A known cursor token continues that scan; anything else is a
        // record-id position for a fresh one.
        let (position, token) = match after {
            None => (None, None),
            Some(a) => match self.cursors.read().unwrap().get(a) {
                Some(state) if state.dataset_key == key => {
                    (Some(state.position.clone()), Some(a.to_string()))
                }
                Some(_) => return Err(IndexError::UnknownCursor(a.to_string())),
                None => (Some(a.to_string()), None),
            },
        };

        let store = self.records.read().unwrap();
        let empty = BTreeMap::new();
        let records = store.get(&key).unwrap_or(&empty);

        let lower = match &position {
            Some(p) => Bound::Excluded(p.as_str()),
            None => Bound::Unbounded,
        };
        let mut page: Vec<Record> = Vec::new();
        let mut more = false;
        for record in records
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| query.matches(r))
        {
            if page.len() == page_size {
                more = true;
                break;
            }
            page.push(record.clone());
        }
        drop(store);

        let mut cursors = self.cursors.write().unwrap();
        let cursor = if more {
            let position = page
                .last()
                .map(|r| r.id.clone())
                .or(position)
                .unwrap_or_default();
            let token = token.unwrap_or_else(|| Uuid::new_v4().to_string());
            cursors.insert(
                token.clone(),
                ScanState {
                    dataset_key: key,
                    position,
                },
            );
            Some(token)
        } else {
            if let Some(token) = token {
                cursors.remove(&token);
            }
            None
        };

        Ok(ScanPage {
            records: page,
            cursor,
        })
    }

    async fn release_scan(&self, cursor: &str) -> Result<(), IndexError> {
        match self.cursors.write().unwrap().remove(cursor) {
            Some(_) => Ok(()),
            None => Err(IndexError::UnknownCursor(cursor.to_string())),
        }
    }
}
