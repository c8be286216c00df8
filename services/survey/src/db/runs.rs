//! Parse run bookkeeping.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ParseRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error: Option<String>,
    pub detail: serde_json::Value,
}

pub async fn create_parse_run(pool: &PgPool, detail: serde_json::Value) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO parse_runs (run_id, status, detail)
        VALUES ($1, 'running', $2)
        "#,
    )
    .bind(run_id)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(run_id)
}

/// Closes a run, merging `detail` into the stored JSON.
pub async fn finish_parse_run(
    pool: &PgPool,
    run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE parse_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn latest_run(pool: &PgPool) -> Result<Option<ParseRun>> {
    let run = sqlx::query_as(
        r#"
        SELECT run_id, started_at, finished_at, status, error, detail
        FROM parse_runs ORDER BY started_at DESC LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(run)
}
