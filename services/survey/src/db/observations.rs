//! Observation repository: transactional flush, the set-based rank-change
//! pass and the filtered read path used by the API.

use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SurveyError};
use crate::observation::{Observation, SheetFamily};
use crate::query::ObservationFilter;
use crate::store::{FlushReport, ObservationStore};

const COLUMNS: &str =
    "indicator_code, area_code, dataset_indicator_code, year, value, scaled, rank, rank_change";

#[derive(Debug, Clone)]
pub struct PgObservationStore {
    pool: PgPool,
}

impl PgObservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ObservationStore for PgObservationStore {
    async fn flush(&mut self, family: SheetFamily, observations: Vec<Observation>) -> Result<FlushReport> {
        let mut report = FlushReport::new(family);
        let mut tx = self.pool.begin().await?;
        for observation in observations {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO observations
                    (id, indicator_code, area_code, dataset_indicator_code, year, value, scaled, rank, rank_change)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&observation.indicator_code)
            .bind(&observation.area_code)
            .bind(&observation.dataset_indicator_code)
            .bind(observation.year)
            .bind(observation.value)
            .bind(observation.scaled)
            .bind(observation.rank)
            .bind(observation.rank_change)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(_) => report.inserted += 1,
                None => {
                    let err = SurveyError::ObservationPersistence { key: observation.key() };
                    warn!("{}", err);
                    report.rejected.push(err);
                }
            }
        }
        tx.commit().await?;
        debug!(
            "Flushed {} family: {} inserted, {} rejected",
            family,
            report.inserted,
            report.rejected.len()
        );
        Ok(report)
    }

    async fn update_rank_changes(&mut self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            WITH ordered AS (
                SELECT id,
                       LAG(rank) OVER (PARTITION BY indicator_code, area_code ORDER BY year) - rank
                           AS change
                FROM observations
                WHERE dataset_indicator_code IS NULL
            )
            UPDATE observations o
            SET rank_change = ordered.change
            FROM ordered
            WHERE o.id = ordered.id
            "#,
        )
        .execute(&mut *tx)
        .await?;
        let (updated,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM observations WHERE rank_change IS NOT NULL")
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(updated as u64)
    }

    async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Observations matching a resolved filter, ordered by rank then area.
pub async fn find(pool: &PgPool, filter: &ObservationFilter) -> Result<Vec<Observation>> {
    let observations = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM observations
        WHERE ($1::text[] IS NULL OR indicator_code = ANY($1))
          AND ($2::text[] IS NULL OR area_code = ANY($2))
          AND ($3::int[] IS NULL OR year = ANY($3))
          AND ($4 OR dataset_indicator_code IS NULL)
        ORDER BY rank ASC NULLS LAST, area_code, indicator_code, year, dataset_indicator_code NULLS FIRST
        "#
    ))
    .bind(&filter.indicator_codes)
    .bind(&filter.area_codes)
    .bind(&filter.years)
    .bind(filter.include_dataset)
    .fetch_all(pool)
    .await?;
    Ok(observations)
}

/// Distinct years with at least one observation, ascending.
pub async fn available_years(pool: &PgPool) -> Result<Vec<i32>> {
    let rows: Vec<(i32,)> = sqlx::query_as("SELECT DISTINCT year FROM observations ORDER BY year")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(year,)| year).collect())
}

/// (year, indicator code) pairs with data, for the years listing.
pub async fn years_with_indicators(pool: &PgPool) -> Result<Vec<(i32, String)>> {
    let rows = sqlx::query_as(
        "SELECT DISTINCT year, indicator_code FROM observations ORDER BY year, indicator_code",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
