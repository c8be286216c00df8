//! Area repository and the enrichment values attached to areas.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

use crate::area::{Area, AreaIndex};
use crate::error::{Result, SurveyError};

#[derive(Debug, sqlx::FromRow)]
struct AreaRow {
    iso3: String,
    iso2: String,
    name: String,
    region: Option<String>,
    income: Option<String>,
    search: Option<String>,
}

impl From<AreaRow> for Area {
    fn from(row: AreaRow) -> Self {
        Area {
            iso3: row.iso3,
            iso2: row.iso2,
            name: row.name,
            region: row.region,
            income: row.income,
            search: row.search,
        }
    }
}

/// A World Bank (or similar) value attached to a country.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AreaInfo {
    pub area_code: String,
    pub indicator_code: String,
    pub year: Option<i32>,
    pub value: Option<f64>,
    pub provider_name: Option<String>,
    pub provider_url: Option<String>,
}

/// Persists regions first, then countries, in one transaction.
pub async fn save_all(pool: &PgPool, areas: &AreaIndex) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for area in areas.regions().chain(areas.countries()) {
        sqlx::query(
            r#"
            INSERT INTO areas (iso3, iso2, name, region, income, search)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (iso3) DO UPDATE
            SET iso2 = EXCLUDED.iso2, name = EXCLUDED.name, region = EXCLUDED.region,
                income = EXCLUDED.income, search = COALESCE(EXCLUDED.search, areas.search)
            "#,
        )
        .bind(&area.iso3)
        .bind(&area.iso2)
        .bind(&area.name)
        .bind(&area.region)
        .bind(&area.income)
        .bind(&area.search)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(areas.len())
}

pub async fn load_index(pool: &PgPool) -> Result<AreaIndex> {
    let rows: Vec<AreaRow> = sqlx::query_as(
        "SELECT iso3, iso2, name, region, income, search FROM areas ORDER BY iso3",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Area::from).collect())
}

pub async fn find_by_iso3(pool: &PgPool, iso3: &str) -> Result<Area> {
    let row: Option<AreaRow> = sqlx::query_as(
        "SELECT iso3, iso2, name, region, income, search FROM areas WHERE iso3 = $1",
    )
    .bind(iso3.trim().to_uppercase())
    .fetch_optional(pool)
    .await?;
    row.map(Area::from)
        .ok_or_else(|| SurveyError::area_not_found(iso3.trim()))
}

pub async fn find_info(pool: &PgPool, iso3: &str) -> Result<Vec<AreaInfo>> {
    let info = sqlx::query_as(
        r#"
        SELECT area_code, indicator_code, year, value, provider_name, provider_url
        FROM area_info WHERE area_code = $1 ORDER BY indicator_code
        "#,
    )
    .bind(iso3)
    .fetch_all(pool)
    .await?;
    Ok(info)
}

/// Every stored enrichment value, grouped by indicator then area.
pub async fn all_info(pool: &PgPool) -> Result<Vec<AreaInfo>> {
    let info = sqlx::query_as(
        r#"
        SELECT area_code, indicator_code, year, value, provider_name, provider_url
        FROM area_info ORDER BY indicator_code, area_code
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(info)
}

pub async fn upsert_info(tx: &mut Transaction<'_, Postgres>, info: &AreaInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO area_info (area_code, indicator_code, year, value, provider_name, provider_url)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (area_code, indicator_code) DO UPDATE
        SET year = EXCLUDED.year, value = EXCLUDED.value,
            provider_name = EXCLUDED.provider_name, provider_url = EXCLUDED.provider_url
        "#,
    )
    .bind(&info.area_code)
    .bind(&info.indicator_code)
    .bind(info.year)
    .bind(info.value)
    .bind(&info.provider_name)
    .bind(&info.provider_url)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Sets the free-text search column; returns false when the area is unknown.
pub async fn update_search(tx: &mut Transaction<'_, Postgres>, iso3: &str, search: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE areas SET search = $2 WHERE iso3 = $1")
        .bind(iso3)
        .bind(search)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}
