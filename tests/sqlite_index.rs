//! SQLite index backend conformance tests.
//!
//! Exercises the sqlx implementation against a real database file,
//! mirroring the semantics the in-memory reference backend pins down:
//! identity uniqueness, idempotent upserts, whole-token FTS matching, and
//! the scan cursor lifecycle.

use std::collections::BTreeMap;

use chrono::Utc;
use tempfile::TempDir;

use annotation_harness::{db, migrate};
use annotation_harness::sqlite_index::SqliteIndex;
use annotation_harness_core::error::IndexError;
use annotation_harness_core::index::{RecordIndex, SortField};
use annotation_harness_core::models::{
    Annotation, ClassLabel, Dataset, DatasetId, LabelingRule, Record, RecordStatus, TaskPayload,
    TaskType,
};
use annotation_harness_core::query::RecordQuery;

async fn open_index() -> (TempDir, SqliteIndex) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("anno.sqlite"))
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();
    // Idempotency: a second run must be harmless.
    migrate::apply(&pool).await.unwrap();
    (tmp, SqliteIndex::new(pool))
}

fn dataset_id() -> DatasetId {
    DatasetId::new("default", "reviews", TaskType::TextClassification)
}

fn dataset() -> Dataset {
    let now = Utc::now();
    Dataset {
        name: "reviews".into(),
        workspace: "default".into(),
        task: TaskType::TextClassification,
        tags: BTreeMap::from([("lang".to_string(), "en".to_string())]),
        metadata: BTreeMap::new(),
        settings: None,
        created_by: Some("ann".to_string()),
        created_at: now,
        updated_at: now,
        rules: Vec::new(),
    }
}

fn record(id: &str, text: &str, label: Option<&str>) -> Record {
    Record {
        id: id.to_string(),
        payload: TaskPayload::TextClassification {
            text: text.to_string(),
        },
        annotation: label.map(|l| Annotation::Labels {
            labels: vec![ClassLabel::new(l)],
        }),
        predictions: Vec::new(),
        status: if label.is_some() {
            RecordStatus::Validated
        } else {
            RecordStatus::Default
        },
        metadata: BTreeMap::new(),
        event_timestamp: None,
        last_updated: None,
    }
}

#[tokio::test]
async fn dataset_roundtrip_and_uniqueness() {
    let (_tmp, index) = open_index().await;

    let mut ds = dataset();
    ds.rules.push(LabelingRule {
        query: "bad".to_string(),
        labels: vec!["negative".to_string()],
        author: Some("ann".to_string()),
        description: None,
        created_at: Utc::now(),
    });
    index.create_dataset(&ds).await.unwrap();

    let found = index.find_dataset(&dataset_id()).await.unwrap().unwrap();
    assert_eq!(found.name, "reviews");
    assert_eq!(found.tags["lang"], "en");
    assert_eq!(found.rules.len(), 1);
    assert_eq!(found.rules[0].query, "bad");

    let err = index.create_dataset(&dataset()).await.unwrap_err();
    assert!(matches!(err, IndexError::DatasetExists(_)));
}

#[tokio::test]
async fn upserts_are_idempotent_by_id() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();

    let outcomes = index
        .upsert_records(&id, &[record("r1", "bad food", None), record("r2", "fine", None)])
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.error.is_none()));

    // Same id again with different text: overwrite, not duplicate.
    index
        .upsert_records(&id, &[record("r1", "wonderful food", None)])
        .await
        .unwrap();

    assert_eq!(
        index.count(&id, &RecordQuery::match_all()).await.unwrap(),
        2
    );
    assert_eq!(
        index
            .count(&id, &RecordQuery::from_text("wonderful"))
            .await
            .unwrap(),
        1
    );
    // The old text no longer matches.
    assert_eq!(
        index.count(&id, &RecordQuery::from_text("bad")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn text_terms_are_conjunctive_whole_tokens() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();
    index
        .upsert_records(
            &id,
            &[
                record("r1", "the food was bad", None),
                record("r2", "bad service all night", None),
                record("r3", "badly lit room", None),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        index.count(&id, &RecordQuery::from_text("bad")).await.unwrap(),
        2
    );
    assert_eq!(
        index
            .count(&id, &RecordQuery::from_text("bad food"))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        index
            .count(&id, &RecordQuery::from_text("bad kitchen"))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn any_text_counts_the_union() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();
    index
        .upsert_records(
            &id,
            &[
                record("r1", "bad food", None),
                record("r2", "bad mood", None),
                record("r3", "good food", None),
                record("r4", "nothing here", None),
            ],
        )
        .await
        .unwrap();

    let union = RecordQuery::any_of(vec!["bad".to_string(), "food".to_string()]);
    assert_eq!(index.count(&id, &union).await.unwrap(), 3);
}

#[tokio::test]
async fn annotated_and_label_filters() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();
    index
        .upsert_records(
            &id,
            &[
                record("r1", "bad food", Some("negative")),
                record("r2", "bad mood", Some("positive")),
                record("r3", "unlabeled", None),
            ],
        )
        .await
        .unwrap();

    assert_eq!(
        index
            .count(&id, &RecordQuery::match_all().with_annotated(true))
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        index
            .count(&id, &RecordQuery::match_all().with_annotated(false))
            .await
            .unwrap(),
        1
    );

    let by_label = RecordQuery {
        annotated_as: vec!["negative".to_string()],
        ..RecordQuery::default()
    };
    assert_eq!(index.count(&id, &by_label).await.unwrap(), 1);
}

#[tokio::test]
async fn search_pages_deterministically_with_metrics() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();
    index
        .upsert_records(
            &id,
            &[
                record("r2", "b", Some("positive")),
                record("r1", "a", None),
                record("r3", "c", None),
            ],
        )
        .await
        .unwrap();

    let page = index
        .search(
            &id,
            &RecordQuery::match_all(),
            &[SortField::asc("id")],
            1,
            1,
            true,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].id, "r2");
    let metrics = page.metrics.unwrap();
    assert_eq!(metrics.status["Default"], 2);
    assert_eq!(metrics.status["Validated"], 1);
    assert_eq!(metrics.annotated_as["positive"], 1);
}

#[tokio::test]
async fn scan_cursor_lifecycle() {
    let (_tmp, index) = open_index().await;
    let id = dataset_id();
    let records: Vec<Record> = (0..5)
        .map(|i| record(&format!("r{:02}", i), "text here", None))
        .collect();
    index.upsert_records(&id, &records).await.unwrap();

    let page = index
        .scan(&id, &RecordQuery::match_all(), None, 2)
        .await
        .unwrap();
    assert_eq!(page.records.len(), 2);
    let cursor = page.cursor.expect("cursor for remaining pages");
    assert_eq!(index.open_cursors(), 1);

    // Early release frees the cursor; releasing again is an error.
    index.release_scan(&cursor).await.unwrap();
    assert_eq!(index.open_cursors(), 0);
    assert!(matches!(
        index.release_scan(&cursor).await.unwrap_err(),
        IndexError::UnknownCursor(_)
    ));

    // A full drain auto-releases on exhaustion.
    let mut after: Option<String> = None;
    let mut seen = 0;
    loop {
        let page = index
            .scan(&id, &RecordQuery::match_all(), after.as_deref(), 2)
            .await
            .unwrap();
        seen += page.records.len();
        match page.cursor {
            Some(cursor) => after = Some(cursor),
            None => break,
        }
    }
    assert_eq!(seen, 5);
    assert_eq!(index.open_cursors(), 0);

    // A plain record id works as a starting position.
    let page = index
        .scan(&id, &RecordQuery::match_all(), Some("r02"), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = page.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["r03", "r04"]);
}
