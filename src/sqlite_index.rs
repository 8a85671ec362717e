//! SQLite-backed [`RecordIndex`] implementation.
//!
//! Dataset documents (tags, metadata, settings, rules) live as JSON columns
//! on the `datasets` table; records keep their full JSON document plus the
//! columns the query layer filters and sorts on. Free-text matching goes
//! through an FTS5 table with the same whole-token AND/OR semantics as the
//! reference matcher in `annotation_harness_core::query`. Scan cursors are
//! tracked in-process: the search-after position is re-issued as a
//! `WHERE id > ?` query per page, so a cursor costs one map entry, but it is
//! still released explicitly like any bounded resource.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use annotation_harness_core::error::IndexError;
use annotation_harness_core::index::{
    RecordIndex, RecordOutcome, ScanPage, SearchPage, SortField, SortOrder,
};
use annotation_harness_core::models::{
    Dataset, DatasetId, Record, SearchAggregations, TaskType,
};
use annotation_harness_core::query::RecordQuery;

struct ScanState {
    dataset_key: String,
    position: String,
}

/// SQLite implementation of the [`RecordIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
    cursors: Mutex<HashMap<String, ScanState>>,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of scan cursors currently held open.
    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }
}

/// WHERE fragment plus its positional binds, built per query.
struct Filter {
    clause: String,
    binds: Vec<String>,
}

/// Quote terms for FTS5 and join them conjunctively. `None` means the
/// expression is blank and matches everything.
fn fts_expression(expr: &str) -> Option<String> {
    let terms: Vec<String> = expr
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

fn build_filter(dataset_key: &str, query: &RecordQuery) -> Filter {
    let mut clause = String::from("r.dataset_key = ?");
    let mut binds = vec![dataset_key.to_string()];

    if let Some(expr) = query.text.as_deref().and_then(fts_expression) {
        clause.push_str(
            " AND (r.dataset_key, r.id) IN \
             (SELECT dataset_key, record_id FROM records_fts WHERE records_fts MATCH ?)",
        );
        binds.push(expr);
    }

    if !query.any_text.is_empty() {
        let groups: Vec<Option<String>> = query
            .any_text
            .iter()
            .map(|e| fts_expression(e))
            .collect();
        // A blank member matches everything, so the disjunction does too.
        if groups.iter().all(|g| g.is_some()) {
            let expr = groups
                .into_iter()
                .flatten()
                .map(|g| format!("({})", g))
                .collect::<Vec<_>>()
                .join(" OR ");
            clause.push_str(
                " AND (r.dataset_key, r.id) IN \
                 (SELECT dataset_key, record_id FROM records_fts WHERE records_fts MATCH ?)",
            );
            binds.push(expr);
        }
    }

    if !query.status.is_empty() {
        let placeholders = vec!["?"; query.status.len()].join(", ");
        clause.push_str(&format!(" AND r.status IN ({})", placeholders));
        binds.extend(query.status.iter().map(|s| s.as_str().to_string()));
    }

    if let Some(annotated) = query.annotated {
        clause.push_str(" AND r.annotated = ?");
        binds.push(if annotated { "1" } else { "0" }.to_string());
    }

    for (labels, kind) in [
        (&query.annotated_as, "annotated"),
        (&query.predicted_as, "predicted"),
    ] {
        if !labels.is_empty() {
            let placeholders = vec!["?"; labels.len()].join(", ");
            clause.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM record_labels rl \
                 WHERE rl.dataset_key = r.dataset_key AND rl.record_id = r.id \
                 AND rl.kind = '{}' AND rl.label IN ({}))",
                kind, placeholders
            ));
            binds.extend(labels.iter().cloned());
        }
    }

    Filter { clause, binds }
}

fn order_clause(sort: &[SortField]) -> String {
    if sort.is_empty() {
        return "r.id ASC".to_string();
    }
    sort.iter()
        .map(|key| {
            let column = match key.field.as_str() {
                "status" => "r.status",
                "event_timestamp" => "r.event_timestamp",
                "last_updated" => "r.last_updated",
                _ => "r.id",
            };
            let direction = match key.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            format!("{} {}", column, direction)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_all<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [String],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        q = q.bind(bind);
    }
    q
}

fn bind_all_scalar<'q, T>(
    mut q: sqlx::query::QueryScalar<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [String],
) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        q = q.bind(bind);
    }
    q
}

fn decode_record(doc_json: &str) -> Result<Record, IndexError> {
    serde_json::from_str(doc_json).map_err(IndexError::backend)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl RecordIndex for SqliteIndex {
    async fn find_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>, IndexError> {
        let row = sqlx::query(
            "SELECT workspace, name, task, tags_json, metadata_json, settings_json, \
             rules_json, created_by, created_at, updated_at \
             FROM datasets WHERE key = ?",
        )
        .bind(id.storage_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(IndexError::backend)?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let task: String = row.get("task");
        let task = TaskType::parse(&task)
            .ok_or_else(|| IndexError::Backend(format!("unknown task tag `{}`", task)))?;
        let tags_json: String = row.get("tags_json");
        let metadata_json: String = row.get("metadata_json");
        let settings_json: Option<String> = row.get("settings_json");
        let rules_json: String = row.get("rules_json");

        Ok(Some(Dataset {
            workspace: row.get("workspace"),
            name: row.get("name"),
            task,
            tags: serde_json::from_str(&tags_json).map_err(IndexError::backend)?,
            metadata: serde_json::from_str(&metadata_json).map_err(IndexError::backend)?,
            settings: settings_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(IndexError::backend)?,
            rules: serde_json::from_str(&rules_json).map_err(IndexError::backend)?,
            created_by: row.get("created_by"),
            created_at: from_millis(row.get("created_at")),
            updated_at: from_millis(row.get("updated_at")),
        }))
    }

    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), IndexError> {
        let key = dataset.id().storage_key();
        let result = sqlx::query(
            "INSERT INTO datasets (key, workspace, name, task, tags_json, metadata_json, \
             settings_json, rules_json, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key)
        .bind(&dataset.workspace)
        .bind(&dataset.name)
        .bind(dataset.task.as_str())
        .bind(serde_json::to_string(&dataset.tags).map_err(IndexError::backend)?)
        .bind(serde_json::to_string(&dataset.metadata).map_err(IndexError::backend)?)
        .bind(
            dataset
                .settings
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(IndexError::backend)?,
        )
        .bind(serde_json::to_string(&dataset.rules).map_err(IndexError::backend)?)
        .bind(&dataset.created_by)
        .bind(millis(dataset.created_at))
        .bind(millis(dataset.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(IndexError::DatasetExists(key)),
            Err(err) => Err(IndexError::backend(err)),
        }
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO datasets (key, workspace, name, task, tags_json, metadata_json, \
             settings_json, rules_json, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                 tags_json = excluded.tags_json, \
                 metadata_json = excluded.metadata_json, \
                 settings_json = excluded.settings_json, \
                 rules_json = excluded.rules_json, \
                 updated_at = excluded.updated_at",
        )
        .bind(dataset.id().storage_key())
        .bind(&dataset.workspace)
        .bind(&dataset.name)
        .bind(dataset.task.as_str())
        .bind(serde_json::to_string(&dataset.tags).map_err(IndexError::backend)?)
        .bind(serde_json::to_string(&dataset.metadata).map_err(IndexError::backend)?)
        .bind(
            dataset
                .settings
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(IndexError::backend)?,
        )
        .bind(serde_json::to_string(&dataset.rules).map_err(IndexError::backend)?)
        .bind(&dataset.created_by)
        .bind(millis(dataset.created_at))
        .bind(millis(dataset.updated_at))
        .execute(&self.pool)
        .await
        .map_err(IndexError::backend)?;
        Ok(())
    }

    async fn upsert_records(
        &self,
        id: &DatasetId,
        records: &[Record],
    ) -> Result<Vec<RecordOutcome>, IndexError> {
        let key = id.storage_key();
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            match self.upsert_one(&key, record).await {
                Ok(()) => outcomes.push(RecordOutcome::ok(&record.id)),
                Err(err) => outcomes.push(RecordOutcome::failed(&record.id, err.to_string())),
            }
        }
        Ok(outcomes)
    }

    async fn count(&self, id: &DatasetId, query: &RecordQuery) -> Result<u64, IndexError> {
        let filter = build_filter(&id.storage_key(), query);
        let sql = format!("SELECT COUNT(*) FROM records r WHERE {}", filter.clause);
        let count: i64 = bind_all_scalar(sqlx::query_scalar(&sql), &filter.binds)
            .fetch_one(&self.pool)
            .await
            .map_err(IndexError::backend)?;
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
        let filter = build_filter(&id.storage_key(), query);

        let count_sql = format!("SELECT COUNT(*) FROM records r WHERE {}", filter.clause);
        let total: i64 = bind_all_scalar(sqlx::query_scalar(&count_sql), &filter.binds)
            .fetch_one(&self.pool)
            .await
            .map_err(IndexError::backend)?;

        let page_sql = format!(
            "SELECT r.doc_json FROM records r WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            filter.clause,
            order_clause(sort),
            limit,
            from
        );
        let rows = bind_all(sqlx::query(&page_sql), &filter.binds)
            .fetch_all(&self.pool)
            .await
            .map_err(IndexError::backend)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc: String = row.get("doc_json");
            records.push(decode_record(&doc)?);
        }

        let metrics = if want_metrics {
            Some(self.aggregate(&filter).await?)
        } else {
            None
        };

        Ok(SearchPage {
            total: total as u64,
            records,
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
        let key = id.storage_key();

        let (position, token) = match after {
            None => (None, None),
            Some(a) => {
                let cursors = self.cursors.lock().unwrap();
                match cursors.get(a) {
                    Some(state) if state.dataset_key == key => {
                        (Some(state.position.clone()), Some(a.to_string()))
                    }
                    Some(_) => return Err(IndexError::UnknownCursor(a.to_string())),
                    None => (Some(a.to_string()), None),
                }
            }
        };

        let filter = build_filter(&key, query);
        let mut clause = filter.clause.clone();
        let mut binds = filter.binds.clone();
        if let Some(position) = &position {
            clause.push_str(" AND r.id > ?");
            binds.push(position.clone());
        }

        // One extra row tells us whether another page exists.
        let sql = format!(
            "SELECT r.doc_json FROM records r WHERE {} ORDER BY r.id ASC LIMIT {}",
            clause,
            page_size + 1
        );
        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(IndexError::backend)?;

        let more = rows.len() > page_size;
        let mut records = Vec::with_capacity(rows.len().min(page_size));
        for row in rows.iter().take(page_size) {
            let doc: String = row.get("doc_json");
            records.push(decode_record(&doc)?);
        }

        let mut cursors = self.cursors.lock().unwrap();
        let cursor = if more {
            let position = records
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

        Ok(ScanPage { records, cursor })
    }

    async fn release_scan(&self, cursor: &str) -> Result<(), IndexError> {
        match self.cursors.lock().unwrap().remove(cursor) {
            Some(_) => Ok(()),
            None => Err(IndexError::UnknownCursor(cursor.to_string())),
        }
    }
}

impl SqliteIndex {
    async fn upsert_one(&self, dataset_key: &str, record: &Record) -> Result<(), IndexError> {
        let doc_json = serde_json::to_string(record).map_err(IndexError::backend)?;
        let mut tx = self.pool.begin().await.map_err(IndexError::backend)?;

        sqlx::query(
            "INSERT INTO records (dataset_key, id, doc_json, status, annotated, \
             event_timestamp, last_updated) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(dataset_key, id) DO UPDATE SET \
                 doc_json = excluded.doc_json, \
                 status = excluded.status, \
                 annotated = excluded.annotated, \
                 event_timestamp = excluded.event_timestamp, \
                 last_updated = excluded.last_updated",
        )
        .bind(dataset_key)
        .bind(&record.id)
        .bind(&doc_json)
        .bind(record.status.as_str())
        .bind(record.is_annotated() as i64)
        .bind(record.event_timestamp.map(millis))
        .bind(record.last_updated.map(millis))
        .execute(&mut *tx)
        .await
        .map_err(IndexError::backend)?;

        sqlx::query("DELETE FROM records_fts WHERE dataset_key = ? AND record_id = ?")
            .bind(dataset_key)
            .bind(&record.id)
            .execute(&mut *tx)
            .await
            .map_err(IndexError::backend)?;
        sqlx::query("INSERT INTO records_fts (dataset_key, record_id, text) VALUES (?, ?, ?)")
            .bind(dataset_key)
            .bind(&record.id)
            .bind(record.text())
            .execute(&mut *tx)
            .await
            .map_err(IndexError::backend)?;

        sqlx::query("DELETE FROM record_labels WHERE dataset_key = ? AND record_id = ?")
            .bind(dataset_key)
            .bind(&record.id)
            .execute(&mut *tx)
            .await
            .map_err(IndexError::backend)?;
        for (labels, kind) in [
            (record.annotated_labels(), "annotated"),
            (record.predicted_labels(), "predicted"),
        ] {
            for label in labels {
                sqlx::query(
                    "INSERT INTO record_labels (dataset_key, record_id, kind, label) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(dataset_key)
                .bind(&record.id)
                .bind(kind)
                .bind(label)
                .execute(&mut *tx)
                .await
                .map_err(IndexError::backend)?;
            }
        }

        tx.commit().await.map_err(IndexError::backend)
    }

    async fn aggregate(&self, filter: &Filter) -> Result<SearchAggregations, IndexError> {
        let mut metrics = SearchAggregations::default();

        let status_sql = format!(
            "SELECT r.status AS k, COUNT(*) AS n FROM records r WHERE {} GROUP BY r.status",
            filter.clause
        );
        for row in bind_all(sqlx::query(&status_sql), &filter.binds)
            .fetch_all(&self.pool)
            .await
            .map_err(IndexError::backend)?
        {
            let k: String = row.get("k");
            let n: i64 = row.get("n");
            metrics.status.insert(k, n as u64);
        }

        for (kind, target) in [("annotated", 0usize), ("predicted", 1usize)] {
            let label_sql = format!(
                "SELECT rl.label AS k, COUNT(*) AS n FROM record_labels rl \
                 JOIN records r ON r.dataset_key = rl.dataset_key AND r.id = rl.record_id \
                 WHERE rl.kind = '{}' AND {} GROUP BY rl.label",
                kind, filter.clause
            );
            for row in bind_all(sqlx::query(&label_sql), &filter.binds)
                .fetch_all(&self.pool)
                .await
                .map_err(IndexError::backend)?
            {
                let k: String = row.get("k");
                let n: i64 = row.get("n");
                let bucket = if target == 0 {
                    &mut metrics.annotated_as
                } else {
                    &mut metrics.predicted_as
                };
                bucket.insert(k, n as u64);
            }
        }

        Ok(metrics)
    }
}
