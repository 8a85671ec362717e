//! Query/search adapter.
//!
//! Normalizes structured queries (absent/empty text means match-all),
//! validates pagination instead of clamping it, and pins down result order:
//! whatever sort the caller asks for, ascending record id is appended as the
//! final tiebreaker so that repeated calls over a fixed index snapshot page
//! through identical results.

use crate::error::Error;
use crate::index::{RecordIndex, SearchPage, SortField, SORTABLE_FIELDS};
use crate::models::DatasetId;
use crate::query::RecordQuery;

/// One search invocation. `from`/`limit` are signed so that transport
/// layers can hand values straight through and let validation reject the
/// out-of-range ones.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Option<RecordQuery>,
    pub sort: Vec<SortField>,
    pub from: i64,
    pub limit: i64,
    pub include_metrics: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            sort: Vec::new(),
            from: 0,
            limit: 50,
            include_metrics: false,
        }
    }
}

/// Run a paged search against a dataset.
///
/// Aggregation metrics are computed only when `include_metrics` is set —
/// an explicit cost opt-in.
pub async fn search(
    index: &dyn RecordIndex,
    dataset: &DatasetId,
    request: SearchRequest,
) -> Result<SearchPage, Error> {
    if request.from < 0 {
        return Err(Error::InvalidPagination(format!(
            "from must be >= 0, got {}",
            request.from
        )));
    }
    if request.limit <= 0 {
        return Err(Error::InvalidPagination(format!(
            "limit must be > 0, got {}",
            request.limit
        )));
    }

    let mut sort = request.sort;
    for key in &sort {
        if !SORTABLE_FIELDS.contains(&key.field.as_str()) {
            return Err(Error::InvalidSort(key.field.clone()));
        }
    }
    if !sort.iter().any(|s| s.field == "id") {
        sort.push(SortField::asc("id"));
    }

    let query = request.query.unwrap_or_default().normalized();

    index
        .search(
            dataset,
            &query,
            &sort,
            request.from as usize,
            request.limit as usize,
            request.include_metrics,
        )
        .await
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::index::SortOrder;
    use crate::models::{Record, RecordStatus, TaskPayload, TaskType};
    use std::collections::BTreeMap;

    fn dataset_id() -> DatasetId {
        DatasetId::new("default", "reviews", TaskType::TextClassification)
    }

    fn record(id: &str, text: &str, status: RecordStatus) -> Record {
        Record {
            id: id.to_string(),
            payload: TaskPayload::TextClassification {
                text: text.to_string(),
            },
            annotation: None,
            predictions: Vec::new(),
            status,
            metadata: BTreeMap::new(),
            event_timestamp: None,
            last_updated: None,
        }
    }

    async fn seeded_index() -> MemoryIndex {
        let index = MemoryIndex::new();
        let records = vec![
            record("r3", "bad service", RecordStatus::Default),
            record("r1", "bad food", RecordStatus::Default),
            record("r2", "great food", RecordStatus::Validated),
        ];
        index
            .upsert_records(&dataset_id(), &records)
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn rejects_invalid_pagination() {
        let index = seeded_index().await;
        let err = search(
            &index,
            &dataset_id(),
            SearchRequest {
                limit: 0,
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPagination(_)));

        let err = search(
            &index,
            &dataset_id(),
            SearchRequest {
                from: -1,
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPagination(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_sort_field() {
        let index = seeded_index().await;
        let err = search(
            &index,
            &dataset_id(),
            SearchRequest {
                sort: vec![SortField::asc("karma")],
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSort(_)));
    }

    #[tokio::test]
    async fn empty_query_matches_all() {
        let index = seeded_index().await;
        let page = search(
            &index,
            &dataset_id(),
            SearchRequest {
                query: Some(RecordQuery::from_text("   ")),
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn pagination_is_stable_under_sort_ties() {
        let index = seeded_index().await;
        // All records tie on status Default except r2; id breaks the ties.
        let request = || SearchRequest {
            sort: vec![SortField {
                field: "status".to_string(),
                order: SortOrder::Asc,
            }],
            limit: 1,
            ..SearchRequest::default()
        };

        let mut ids = Vec::new();
        for from in 0..3 {
            let page = search(
                &index,
                &dataset_id(),
                SearchRequest {
                    from,
                    ..request()
                },
            )
            .await
            .unwrap();
            ids.push(page.records[0].id.clone());
        }
        assert_eq!(ids, vec!["r1", "r3", "r2"]);

        // Same call, same page.
        let again = search(&index, &dataset_id(), request()).await.unwrap();
        assert_eq!(again.records[0].id, "r1");
    }

    #[tokio::test]
    async fn metrics_are_opt_in() {
        let index = seeded_index().await;
        let page = search(&index, &dataset_id(), SearchRequest::default())
            .await
            .unwrap();
        assert!(page.metrics.is_none());

        let page = search(
            &index,
            &dataset_id(),
            SearchRequest {
                include_metrics: true,
                ..SearchRequest::default()
            },
        )
        .await
        .unwrap();
        let metrics = page.metrics.unwrap();
        assert_eq!(metrics.status["Default"], 2);
        assert_eq!(metrics.status["Validated"], 1);
    }
}
