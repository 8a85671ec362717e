//! Labeling rules: CRUD and weak-supervision metrics.
//!
//! Rules are keyed within their dataset by the exact query string, which is
//! immutable once created; updates may only change target labels and the
//! description. Rule definitions are persisted on the dataset document
//! itself.
//!
//! Metrics are computed on demand from live index state — no caching, no
//! staleness guarantee across calls. The dataset-level aggregate counts the
//! *union* of all rules' matched sets (one disjunction query, so overlapping
//! rules are not double-counted) and weights overall precision by each
//! rule's annotated-matched count so low-coverage rules do not distort it.

use chrono::Utc;
use futures::future::try_join_all;

use crate::error::{Error, InvalidRecord};
use crate::index::RecordIndex;
use crate::models::{Dataset, DatasetRulesMetrics, LabelingRule, RuleMetrics};
use crate::query::RecordQuery;

/// Page size used when tallying annotated matches for precision.
const METRICS_PAGE_SIZE: usize = 500;

/// A rule creation request; `created_at` is stamped by [`add_rule`].
#[derive(Debug, Clone)]
pub struct NewRule {
    pub query: String,
    pub labels: Vec<String>,
    pub description: Option<String>,
    pub author: Option<String>,
}

pub async fn list_rules(
    index: &dyn RecordIndex,
    dataset: &Dataset,
) -> Result<Vec<LabelingRule>, Error> {
    // Rules live on the dataset document; re-read it so concurrent edits
    // from other callers are visible.
    let dataset = refreshed(index, dataset).await?;
    Ok(dataset.rules)
}

/// Add a rule. Fails with [`Error::RuleConflict`] when a rule with the same
/// query already exists; the rule set is left untouched on failure.
pub async fn add_rule(
    index: &dyn RecordIndex,
    dataset: &Dataset,
    rule: NewRule,
) -> Result<LabelingRule, Error> {
    let mut dataset = refreshed(index, dataset).await?;
    if rule.query.trim().is_empty() {
        return Err(Error::Validation {
            dataset: dataset.name.clone(),
            records: vec![InvalidRecord {
                id: rule.query,
                reason: "rule query must not be empty".to_string(),
            }],
        });
    }
    if dataset.rules.iter().any(|r| r.query == rule.query) {
        return Err(Error::RuleConflict(rule.query));
    }
    check_labels_against_schema(&dataset, &rule.labels)?;

    let stored = LabelingRule {
        query: rule.query,
        labels: rule.labels,
        author: rule.author,
        description: rule.description,
        created_at: Utc::now(),
    };
    dataset.rules.push(stored.clone());
    dataset.updated_at = Utc::now();
    index.update_dataset(&dataset).await?;
    Ok(stored)
}

pub async fn find_rule(
    index: &dyn RecordIndex,
    dataset: &Dataset,
    query: &str,
) -> Result<LabelingRule, Error> {
    let dataset = refreshed(index, dataset).await?;
    dataset
        .rules
        .into_iter()
        .find(|r| r.query == query)
        .ok_or_else(|| Error::RuleNotFound(query.to_string()))
}

/// Update a rule's target labels and/or description. The query never
/// changes; `None` keeps the stored value.
pub async fn update_rule(
    index: &dyn RecordIndex,
    dataset: &Dataset,
    query: &str,
    labels: Option<Vec<String>>,
    description: Option<String>,
) -> Result<LabelingRule, Error> {
    let mut dataset = refreshed(index, dataset).await?;
    if let Some(labels) = &labels {
        check_labels_against_schema(&dataset, labels)?;
    }
    let rule = dataset
        .rules
        .iter_mut()
        .find(|r| r.query == query)
        .ok_or_else(|| Error::RuleNotFound(query.to_string()))?;
    if let Some(labels) = labels {
        rule.labels = labels;
    }
    if let Some(description) = description {
        rule.description = Some(description);
    }
    let updated = rule.clone();
    dataset.updated_at = Utc::now();
    index.update_dataset(&dataset).await?;
    Ok(updated)
}

pub async fn delete_rule(
    index: &dyn RecordIndex,
    dataset: &Dataset,
    query: &str,
) -> Result<(), Error> {
    let mut dataset = refreshed(index, dataset).await?;
    let before = dataset.rules.len();
    dataset.rules.retain(|r| r.query != query);
    if dataset.rules.len() == before {
        return Err(Error::RuleNotFound(query.to_string()));
    }
    dataset.updated_at = Utc::now();
    index.update_dataset(&dataset).await?;
    Ok(())
}

/// Compute metrics for one rule query.
///
/// `labels` overrides the target label set; when absent, the stored rule's
/// labels apply (if such a rule exists). Without any target labels only the
/// coverage figures are reported — the precision fields stay unset, which is
/// distinct from a precision of zero.
pub async fn rule_metrics(
    index: &dyn RecordIndex,
    dataset: &Dataset,
    query: &str,
    labels: Option<&[String]>,
) -> Result<RuleMetrics, Error> {
    let id = dataset.id();
    let rule_query = RecordQuery::from_text(query).normalized();

    let total = index.count(&id, &RecordQuery::match_all()).await?;
    let annotated_total = index
        .count(&id, &RecordQuery::match_all().with_annotated(true))
        .await?;
    let matched = index.count(&id, &rule_query).await?;

    let target: Vec<String> = match labels {
        Some(labels) => labels.to_vec(),
        None => dataset
            .rules
            .iter()
            .find(|r| r.query == query)
            .map(|r| r.labels.clone())
            .unwrap_or_default(),
    };

    let (annotated_matched, correct, incorrect) = if target.is_empty() {
        let annotated_matched = index
            .count(&id, &rule_query.clone().with_annotated(true))
            .await?;
        (annotated_matched, None, None)
    } else {
        let (annotated_matched, correct) =
            tally_correct(index, &id, rule_query.clone(), &target).await?;
        (annotated_matched, Some(correct), Some(annotated_matched - correct))
    };

    Ok(RuleMetrics {
        total_records: total,
        annotated_records: annotated_total,
        coverage: ratio(matched, total),
        coverage_annotated: ratio(annotated_matched, total),
        correct,
        incorrect,
        precision: correct.and_then(|c| ratio(c, annotated_matched)),
    })
}

/// Compute the aggregate metrics over every stored rule.
///
/// Per-rule reads are dispatched concurrently; the aggregate is best-effort
/// over possibly-non-simultaneous reads, not an atomic snapshot.
pub async fn dataset_rules_metrics(
    index: &dyn RecordIndex,
    dataset: &Dataset,
) -> Result<DatasetRulesMetrics, Error> {
    let dataset = refreshed(index, dataset).await?;
    let id = dataset.id();

    let total = index.count(&id, &RecordQuery::match_all()).await?;
    let annotated_total = index
        .count(&id, &RecordQuery::match_all().with_annotated(true))
        .await?;

    if dataset.rules.is_empty() {
        return Ok(DatasetRulesMetrics {
            total_records: total,
            annotated_records: annotated_total,
            coverage: ratio(0, total),
            coverage_annotated: ratio(0, total),
            precision: None,
        });
    }

    // The union of matched sets is one disjunction query, not a sum of
    // per-rule counts: overlapping rules must not be double-counted.
    let union = RecordQuery::any_of(dataset.rules.iter().map(|r| r.query.clone())).normalized();
    let union_matched = index.count(&id, &union).await?;
    let union_annotated = index
        .count(&id, &union.clone().with_annotated(true))
        .await?;

    let per_rule = try_join_all(
        dataset
            .rules
            .iter()
            .map(|rule| rule_metrics(index, &dataset, &rule.query, None)),
    )
    .await?;

    let mut weight_sum = 0u64;
    let mut weighted = 0.0f64;
    for metrics in &per_rule {
        if let (Some(precision), Some(correct), Some(incorrect)) =
            (metrics.precision, metrics.correct, metrics.incorrect)
        {
            let weight = correct + incorrect;
            weight_sum += weight;
            weighted += precision * weight as f64;
        }
    }

    Ok(DatasetRulesMetrics {
        total_records: total,
        annotated_records: annotated_total,
        coverage: ratio(union_matched, total),
        coverage_annotated: ratio(union_annotated, total),
        precision: if weight_sum == 0 {
            None
        } else {
            Some(weighted / weight_sum as f64)
        },
    })
}

/// Scan the annotated records matched by `query`, tallying how many carry a
/// validated label inside the target set. Uses search-after pages, never
/// offset pagination.
async fn tally_correct(
    index: &dyn RecordIndex,
    id: &crate::models::DatasetId,
    query: RecordQuery,
    target: &[String],
) -> Result<(u64, u64), Error> {
    let query = query.with_annotated(true);
    let mut annotated_matched = 0u64;
    let mut correct = 0u64;
    let mut after: Option<String> = None;
    loop {
        let page = index
            .scan(id, &query, after.as_deref(), METRICS_PAGE_SIZE)
            .await?;
        for record in &page.records {
            annotated_matched += 1;
            let labels = record.annotated_labels();
            if labels.iter().any(|l| target.iter().any(|t| t == l)) {
                correct += 1;
            }
        }
        match page.cursor {
            Some(cursor) => after = Some(cursor),
            None => break,
        }
    }
    Ok((annotated_matched, correct))
}

fn check_labels_against_schema(dataset: &Dataset, labels: &[String]) -> Result<(), Error> {
    let schema = dataset.settings.as_ref().and_then(|s| s.label_schema.as_ref());
    if let Some(schema) = schema {
        let offenders: Vec<InvalidRecord> = labels
            .iter()
            .filter(|label| !schema.iter().any(|allowed| allowed == *label))
            .map(|label| InvalidRecord {
                id: label.clone(),
                reason: format!("label `{}` is not in the dataset schema", label),
            })
            .collect();
        if !offenders.is_empty() {
            return Err(Error::Validation {
                dataset: dataset.name.clone(),
                records: offenders,
            });
        }
    }
    Ok(())
}

async fn refreshed(index: &dyn RecordIndex, dataset: &Dataset) -> Result<Dataset, Error> {
    let id = dataset.id();
    index
        .find_dataset(&id)
        .await?
        .ok_or_else(|| Error::DatasetNotFound(id.to_string()))
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::models::{Annotation, ClassLabel, Record, RecordStatus, TaskPayload, TaskType};
    use std::collections::BTreeMap;

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

    fn empty_dataset() -> Dataset {
        let now = Utc::now();
        Dataset {
            name: "reviews".into(),
            workspace: "default".into(),
            task: TaskType::TextClassification,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            settings: None,
            created_by: None,
            created_at: now,
            updated_at: now,
            rules: Vec::new(),
        }
    }

    async fn seeded(records: &[Record]) -> (MemoryIndex, Dataset) {
        let index = MemoryIndex::new();
        let dataset = empty_dataset();
        index.create_dataset(&dataset).await.unwrap();
        index
            .upsert_records(&dataset.id(), records)
            .await
            .unwrap();
        (index, dataset)
    }

    fn new_rule(query: &str, labels: &[&str]) -> NewRule {
        NewRule {
            query: query.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            description: None,
            author: Some("tester".to_string()),
        }
    }

    #[tokio::test]
    async fn duplicate_query_conflicts_and_leaves_rules_untouched() {
        let (index, dataset) = seeded(&[]).await;
        add_rule(&index, &dataset, new_rule("bad", &["negative"]))
            .await
            .unwrap();
        let err = add_rule(&index, &dataset, new_rule("bad", &["positive"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuleConflict(_)));

        let rules = list_rules(&index, &dataset).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].labels, vec!["negative"]);
    }

    #[tokio::test]
    async fn update_changes_labels_and_description_only() {
        let (index, dataset) = seeded(&[]).await;
        add_rule(&index, &dataset, new_rule("bad", &["negative"]))
            .await
            .unwrap();
        let updated = update_rule(
            &index,
            &dataset,
            "bad",
            Some(vec!["negative".into(), "neutral".into()]),
            Some("catches complaints".into()),
        )
        .await
        .unwrap();
        assert_eq!(updated.query, "bad");
        assert_eq!(updated.labels.len(), 2);
        assert_eq!(updated.description.as_deref(), Some("catches complaints"));

        let err = update_rule(&index, &dataset, "missing", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuleNotFound(_)));
    }

    #[tokio::test]
    async fn delete_and_find_are_exact_match() {
        let (index, dataset) = seeded(&[]).await;
        add_rule(&index, &dataset, new_rule("bad service", &[]))
            .await
            .unwrap();
        assert!(find_rule(&index, &dataset, "bad service").await.is_ok());
        assert!(matches!(
            find_rule(&index, &dataset, "bad").await.unwrap_err(),
            Error::RuleNotFound(_)
        ));
        delete_rule(&index, &dataset, "bad service").await.unwrap();
        assert!(matches!(
            delete_rule(&index, &dataset, "bad service").await.unwrap_err(),
            Error::RuleNotFound(_)
        ));
    }

    #[tokio::test]
    async fn coverage_is_undefined_on_an_empty_dataset() {
        let (index, dataset) = seeded(&[]).await;
        let metrics = rule_metrics(&index, &dataset, "bad", None).await.unwrap();
        assert_eq!(metrics.total_records, 0);
        assert_eq!(metrics.coverage, None);
        assert_eq!(metrics.coverage_annotated, None);
        assert_eq!(metrics.precision, None);
    }

    // The reference scenario: "bad" matches {r1, r2} of three records; r1 is
    // validated negative (in the target set), r2 validated positive (not).
    #[tokio::test]
    async fn precision_scenario() {
        let (index, dataset) = seeded(&[
            record("r1", "bad food", Some("negative")),
            record("r2", "bad but fun", Some("positive")),
            record("r3", "lovely", None),
        ])
        .await;

        let target = vec!["negative".to_string()];
        let metrics = rule_metrics(&index, &dataset, "bad", Some(&target))
            .await
            .unwrap();
        assert_eq!(metrics.coverage, Some(2.0 / 3.0));
        assert_eq!(metrics.coverage_annotated, Some(2.0 / 3.0));
        assert_eq!(metrics.correct, Some(1));
        assert_eq!(metrics.incorrect, Some(1));
        assert_eq!(metrics.precision, Some(0.5));
    }

    #[tokio::test]
    async fn precision_fields_unset_without_target_labels() {
        let (index, dataset) = seeded(&[
            record("r1", "bad food", Some("negative")),
            record("r2", "fine", None),
        ])
        .await;
        let metrics = rule_metrics(&index, &dataset, "bad", None).await.unwrap();
        assert_eq!(metrics.coverage, Some(0.5));
        assert_eq!(metrics.correct, None);
        assert_eq!(metrics.incorrect, None);
        assert_eq!(metrics.precision, None);
    }

    #[tokio::test]
    async fn metrics_fall_back_to_stored_rule_labels() {
        let (index, dataset) = seeded(&[
            record("r1", "bad food", Some("negative")),
            record("r2", "bad vibes", Some("positive")),
        ])
        .await;
        add_rule(&index, &dataset, new_rule("bad", &["negative"]))
            .await
            .unwrap();
        let dataset = index.find_dataset(&dataset.id()).await.unwrap().unwrap();
        let metrics = rule_metrics(&index, &dataset, "bad", None).await.unwrap();
        assert_eq!(metrics.precision, Some(0.5));
    }

    #[tokio::test]
    async fn union_coverage_deduplicates_overlap() {
        // "bad" matches {r1, r2}; "food" matches {r1, r3}: union is 3 of 4.
        let (index, dataset) = seeded(&[
            record("r1", "bad food", None),
            record("r2", "bad mood", None),
            record("r3", "good food", None),
            record("r4", "nothing here", None),
        ])
        .await;
        add_rule(&index, &dataset, new_rule("bad", &[])).await.unwrap();
        add_rule(&index, &dataset, new_rule("food", &[])).await.unwrap();

        let aggregate = dataset_rules_metrics(&index, &dataset).await.unwrap();
        assert_eq!(aggregate.coverage, Some(3.0 / 4.0));

        // Dedup bounds: max(coverage_i) <= union <= sum(coverage_i).
        let per_rule = [2.0 / 4.0, 2.0 / 4.0];
        let union = aggregate.coverage.unwrap();
        assert!(union >= per_rule.iter().cloned().fold(0.0, f64::max));
        assert!(union <= per_rule.iter().sum::<f64>());
    }

    #[tokio::test]
    async fn union_equals_sum_for_disjoint_rules() {
        let (index, dataset) = seeded(&[
            record("r1", "alpha", None),
            record("r2", "beta", None),
            record("r3", "gamma", None),
        ])
        .await;
        add_rule(&index, &dataset, new_rule("alpha", &[])).await.unwrap();
        add_rule(&index, &dataset, new_rule("beta", &[])).await.unwrap();

        let aggregate = dataset_rules_metrics(&index, &dataset).await.unwrap();
        assert_eq!(aggregate.coverage, Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn aggregate_precision_is_weighted_by_annotated_matches() {
        // Rule "alpha": 1 annotated match, precision 1.0.
        // Rule "common": 4 annotated matches, precision 0.25.
        // Weighted: (1.0*1 + 0.25*4) / 5 = 0.4; unweighted mean would be 0.625.
        let (index, dataset) = seeded(&[
            record("a1", "alpha common", Some("good")),
            record("c1", "common", Some("bad")),
            record("c2", "common", Some("bad")),
            record("c3", "common", Some("bad")),
        ])
        .await;
        add_rule(&index, &dataset, new_rule("alpha", &["good"]))
            .await
            .unwrap();
        add_rule(&index, &dataset, new_rule("common", &["good"]))
            .await
            .unwrap();

        let aggregate = dataset_rules_metrics(&index, &dataset).await.unwrap();
        let precision = aggregate.precision.unwrap();
        assert!((precision - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn aggregate_without_rules_reports_zero_coverage() {
        let (index, dataset) = seeded(&[record("r1", "text", None)]).await;
        let aggregate = dataset_rules_metrics(&index, &dataset).await.unwrap();
        assert_eq!(aggregate.coverage, Some(0.0));
        assert_eq!(aggregate.precision, None);
    }

    #[tokio::test]
    async fn out_of_schema_rule_labels_are_rejected() {
        let (index, mut dataset) = seeded(&[]).await;
        dataset.settings = Some(crate::models::DatasetSettings {
            label_schema: Some(vec!["positive".into(), "negative".into()]),
        });
        index.update_dataset(&dataset).await.unwrap();

        let err = add_rule(&index, &dataset, new_rule("bad", &["spam"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(list_rules(&index, &dataset).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_dataset_is_not_found() {
        let index = MemoryIndex::new();
        let dataset = empty_dataset();
        let err = list_rules(&index, &dataset).await.unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound(_)));
    }
}
