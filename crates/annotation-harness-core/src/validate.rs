//! Batch validation against dataset settings.
//!
//! Validation runs over the whole batch before any write and is
//! all-or-nothing: a single offending record aborts the entire ingestion
//! with [`Error::Validation`] enumerating every failure.

use async_trait::async_trait;

use crate::error::{Error, InvalidRecord};
use crate::models::{Annotation, Dataset, Record, TaskPayload};

#[async_trait]
pub trait RecordValidator: Send + Sync {
    async fn validate(&self, dataset: &Dataset, records: &[Record]) -> Result<(), Error>;
}

/// Default validator: records must carry a non-empty id, a payload of the
/// dataset's task, well-formed entity spans, and — when the dataset carries
/// a label schema — only in-schema annotation and prediction labels.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    fn check(dataset: &Dataset, record: &Record) -> Option<String> {
        if record.id.trim().is_empty() {
            return Some("record id must not be empty".to_string());
        }
        if record.task() != dataset.task {
            return Some(format!(
                "payload task {} does not match dataset task {}",
                record.task(),
                dataset.task
            ));
        }
        if let TaskPayload::TokenClassification { text, tokens } = &record.payload {
            if tokens.is_empty() {
                return Some("token classification records require tokens".to_string());
            }
            let annotations = record
                .annotation
                .iter()
                .chain(record.predictions.iter().map(|p| &p.annotation));
            for annotation in annotations {
                if let Annotation::Entities { entities } = annotation {
                    for entity in entities {
                        if entity.start >= entity.end || entity.end > text.len() {
                            return Some(format!(
                                "entity span {}..{} is outside the text",
                                entity.start, entity.end
                            ));
                        }
                    }
                }
            }
        }
        let schema = dataset.settings.as_ref().and_then(|s| s.label_schema.as_ref());
        if let Some(schema) = schema {
            let mut labels = record.annotated_labels();
            labels.extend(record.predicted_labels());
            for label in labels {
                if !schema.iter().any(|allowed| allowed == label) {
                    return Some(format!("label `{}` is not in the dataset schema", label));
                }
            }
        }
        None
    }
}

#[async_trait]
impl RecordValidator for SchemaValidator {
    async fn validate(&self, dataset: &Dataset, records: &[Record]) -> Result<(), Error> {
        let offenders: Vec<InvalidRecord> = records
            .iter()
            .filter_map(|record| {
                Self::check(dataset, record).map(|reason| InvalidRecord {
                    id: record.id.clone(),
                    reason,
                })
            })
            .collect();

        if offenders.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                dataset: dataset.name.clone(),
                records: offenders,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ClassLabel, DatasetSettings, EntitySpan, RecordStatus, TaskPayload, TaskType,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn dataset(schema: Option<Vec<&str>>) -> Dataset {
        let now = Utc::now();
        Dataset {
            name: "reviews".into(),
            workspace: "default".into(),
            task: TaskType::TextClassification,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            settings: schema.map(|labels| DatasetSettings {
                label_schema: Some(labels.into_iter().map(String::from).collect()),
            }),
            created_by: None,
            created_at: now,
            updated_at: now,
            rules: Vec::new(),
        }
    }

    fn record(id: &str) -> Record {
        Record {
            id: id.to_string(),
            payload: TaskPayload::TextClassification {
                text: "fine".to_string(),
            },
            annotation: None,
            predictions: Vec::new(),
            status: RecordStatus::Default,
            metadata: BTreeMap::new(),
            event_timestamp: None,
            last_updated: None,
        }
    }

    #[tokio::test]
    async fn out_of_schema_label_fails_the_batch() {
        let ds = dataset(Some(vec!["positive", "negative"]));
        let mut bad = record("r2");
        bad.annotation = Some(Annotation::Labels {
            labels: vec![ClassLabel::new("neutral")],
        });
        let err = SchemaValidator
            .validate(&ds, &[record("r1"), bad])
            .await
            .unwrap_err();
        match err {
            Error::Validation { records, .. } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, "r2");
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[tokio::test]
    async fn task_mismatch_is_reported() {
        let ds = dataset(None);
        let mismatched = Record {
            payload: TaskPayload::TokenClassification {
                text: "a b".to_string(),
                tokens: vec!["a".into(), "b".into()],
            },
            ..record("r1")
        };
        assert!(SchemaValidator.validate(&ds, &[mismatched]).await.is_err());
    }

    #[tokio::test]
    async fn entity_span_bounds_are_checked() {
        let mut ds = dataset(None);
        ds.task = TaskType::TokenClassification;
        let mut r = Record {
            payload: TaskPayload::TokenClassification {
                text: "short".to_string(),
                tokens: vec!["short".into()],
            },
            ..record("r1")
        };
        r.annotation = Some(Annotation::Entities {
            entities: vec![EntitySpan {
                label: "X".into(),
                start: 2,
                end: 99,
            }],
        });
        assert!(SchemaValidator.validate(&ds, &[r]).await.is_err());
    }

    #[tokio::test]
    async fn clean_batch_passes() {
        let ds = dataset(Some(vec!["positive"]));
        let mut r = record("r1");
        r.annotation = Some(Annotation::Labels {
            labels: vec![ClassLabel::new("positive")],
        });
        assert!(SchemaValidator.validate(&ds, &[r]).await.is_ok());
    }
}
