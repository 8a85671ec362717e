//! Bulk ingestion coordinator.
//!
//! Resolves (or creates) the target dataset, merges its tags/metadata,
//! validates the whole batch up front, then upserts each record into the
//! index. Validation failure aborts the batch before any write; per-record
//! write failures are recoverable and only counted. There is no rollback of
//! already-written records.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{Error, IndexError};
use crate::index::RecordIndex;
use crate::models::{BulkResult, Dataset, DatasetId, Record, TaskType};
use crate::validate::RecordValidator;

/// One bulk ingestion call.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub workspace: String,
    pub name: String,
    pub task: TaskType,
    pub tags: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_by: Option<String>,
    pub records: Vec<Record>,
}

/// Ingest a batch of records into the dataset identified by
/// `(workspace, name, task)`, creating the dataset on first use.
///
/// Two concurrent first-time ingests may race to create the dataset; the
/// index enforces identity uniqueness, and the loser's create degrades into
/// an update of the winning dataset.
pub async fn ingest(
    index: &dyn RecordIndex,
    validator: &dyn RecordValidator,
    request: IngestRequest,
) -> Result<BulkResult, Error> {
    let id = DatasetId::new(request.workspace.clone(), request.name.clone(), request.task);

    let dataset = match index.find_dataset(&id).await? {
        Some(mut dataset) => {
            dataset.merge(&request.tags, &request.metadata, Utc::now());
            index.update_dataset(&dataset).await?;
            dataset
        }
        // The NotFound outcome of the probe is the creation path, not an
        // error surfaced to the caller.
        None => create_or_adopt(index, &id, &request).await?,
    };

    validator.validate(&dataset, &request.records).await?;

    let now = Utc::now();
    let records: Vec<Record> = request
        .records
        .into_iter()
        .map(|mut record| {
            record.last_updated = Some(now);
            record
        })
        .collect();

    let outcomes = index.upsert_records(&id, &records).await?;
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();

    Ok(BulkResult {
        dataset: request.name,
        processed: outcomes.len() - failed,
        failed,
    })
}

/// Create the dataset, or — when a concurrent ingest won the race — adopt
/// the winner and merge our tags/metadata into it.
async fn create_or_adopt(
    index: &dyn RecordIndex,
    id: &DatasetId,
    request: &IngestRequest,
) -> Result<Dataset, Error> {
    let now = Utc::now();
    let dataset = Dataset {
        name: request.name.clone(),
        workspace: request.workspace.clone(),
        task: request.task,
        tags: request.tags.clone(),
        metadata: request.metadata.clone(),
        settings: Some(request.task.default_settings()),
        created_by: request.created_by.clone(),
        created_at: now,
        updated_at: now,
        rules: Vec::new(),
    };

    match index.create_dataset(&dataset).await {
        Ok(()) => Ok(dataset),
        Err(IndexError::DatasetExists(_)) => {
            let mut winner = index
                .find_dataset(id)
                .await?
                .ok_or_else(|| Error::DatasetNotFound(id.to_string()))?;
            winner.merge(&request.tags, &request.metadata, Utc::now());
            index.update_dataset(&winner).await?;
            Ok(winner)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::models::{Annotation, ClassLabel, RecordStatus, TaskPayload};
    use crate::query::RecordQuery;
    use crate::validate::SchemaValidator;

    fn record(id: &str, text: &str) -> Record {
        Record {
            id: id.to_string(),
            payload: TaskPayload::TextClassification {
                text: text.to_string(),
            },
            annotation: None,
            predictions: Vec::new(),
            status: RecordStatus::Default,
            metadata: BTreeMap::new(),
            event_timestamp: None,
            last_updated: None,
        }
    }

    fn request(records: Vec<Record>, tags: &[(&str, &str)]) -> IngestRequest {
        IngestRequest {
            workspace: "default".to_string(),
            name: "reviews".to_string(),
            task: TaskType::TextClassification,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            metadata: BTreeMap::new(),
            created_by: None,
            records,
        }
    }

    fn dataset_id() -> DatasetId {
        DatasetId::new("default", "reviews", TaskType::TextClassification)
    }

    #[tokio::test]
    async fn first_ingest_creates_the_dataset() {
        let index = MemoryIndex::new();
        let result = ingest(
            &index,
            &SchemaValidator,
            request(
                vec![record("r1", "a"), record("r2", "b"), record("r3", "c")],
                &[("lang", "en")],
            ),
        )
        .await
        .unwrap();

        assert_eq!(result.processed, 3);
        assert_eq!(result.failed, 0);
        let dataset = index.find_dataset(&dataset_id()).await.unwrap().unwrap();
        assert_eq!(dataset.tags["lang"], "en");
        assert!(dataset.settings.is_some());
    }

    #[tokio::test]
    async fn reingest_is_idempotent_and_merges_tags() {
        let index = MemoryIndex::new();
        ingest(
            &index,
            &SchemaValidator,
            request(
                vec![record("r1", "a"), record("r2", "b"), record("r3", "c")],
                &[("lang", "en")],
            ),
        )
        .await
        .unwrap();

        // Same ids again, one field changed, a new tag added.
        let result = ingest(
            &index,
            &SchemaValidator,
            request(
                vec![
                    record("r1", "a updated"),
                    record("r2", "b"),
                    record("r3", "c"),
                ],
                &[("lang", "en"), ("domain", "movies")],
            ),
        )
        .await
        .unwrap();
        assert_eq!(result.processed, 3);

        let id = dataset_id();
        assert_eq!(
            index.count(&id, &RecordQuery::match_all()).await.unwrap(),
            3
        );
        let dataset = index.find_dataset(&id).await.unwrap().unwrap();
        assert_eq!(dataset.tags["lang"], "en");
        assert_eq!(dataset.tags["domain"], "movies");

        let page = index
            .search(&id, &RecordQuery::from_text("updated"), &[], 0, 10, false)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].id, "r1");
    }

    #[tokio::test]
    async fn validation_failure_aborts_the_whole_batch() {
        let index = MemoryIndex::new();
        ingest(
            &index,
            &SchemaValidator,
            request(vec![record("seed", "x")], &[]),
        )
        .await
        .unwrap();

        // Attach a schema, then send one in-schema and one out-of-schema record.
        let id = dataset_id();
        let mut dataset = index.find_dataset(&id).await.unwrap().unwrap();
        dataset.settings = Some(crate::models::DatasetSettings {
            label_schema: Some(vec!["positive".into(), "negative".into()]),
        });
        index.update_dataset(&dataset).await.unwrap();

        let mut good = record("good", "y");
        good.annotation = Some(Annotation::Labels {
            labels: vec![ClassLabel::new("positive")],
        });
        let mut bad = record("bad", "z");
        bad.annotation = Some(Annotation::Labels {
            labels: vec![ClassLabel::new("spam")],
        });

        let err = ingest(&index, &SchemaValidator, request(vec![good, bad], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        // Nothing from the failed batch was written.
        assert_eq!(
            index.count(&id, &RecordQuery::match_all()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn write_failures_are_counted_not_fatal() {
        let index = MemoryIndex::new();
        index.fail_record_write("r2");

        let result = ingest(
            &index,
            &SchemaValidator,
            request(
                vec![record("r1", "a"), record("r2", "b"), record("r3", "c")],
                &[],
            ),
        )
        .await
        .unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(
            index
                .count(&dataset_id(), &RecordQuery::match_all())
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn create_race_degrades_to_update() {
        // Pre-create the dataset to stand in for a concurrent winner.
        let index = MemoryIndex::new();
        ingest(
            &index,
            &SchemaValidator,
            request(vec![record("r1", "a")], &[("lang", "en")]),
        )
        .await
        .unwrap();

        let losing = create_or_adopt(
            &index,
            &dataset_id(),
            &request(Vec::new(), &[("domain", "movies")]),
        )
        .await
        .unwrap();
        assert_eq!(losing.tags["lang"], "en");
        assert_eq!(losing.tags["domain"], "movies");
    }
}
