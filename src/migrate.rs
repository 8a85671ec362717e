use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Dataset documents; rules are persisted on the dataset row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            key TEXT PRIMARY KEY,
            workspace TEXT NOT NULL,
            name TEXT NOT NULL,
            task TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '{}',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            settings_json TEXT,
            rules_json TEXT NOT NULL DEFAULT '[]',
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(workspace, name, task)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Records, keyed by caller-supplied id within their dataset
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            dataset_key TEXT NOT NULL,
            id TEXT NOT NULL,
            doc_json TEXT NOT NULL,
            status TEXT NOT NULL,
            annotated INTEGER NOT NULL DEFAULT 0,
            event_timestamp INTEGER,
            last_updated INTEGER,
            PRIMARY KEY (dataset_key, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Label facets used by annotated_as / predicted_as filters and
    // aggregations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_labels (
            dataset_key TEXT NOT NULL,
            record_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            label TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over record text
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='records_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE records_fts USING fts5(
                dataset_key UNINDEXED,
                record_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_dataset_id ON records(dataset_key, id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_labels_lookup \
         ON record_labels(dataset_key, record_id, kind, label)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_datasets_workspace ON datasets(workspace)")
        .execute(pool)
        .await?;

    Ok(())
}
