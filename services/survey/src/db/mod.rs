//! Postgres repositories for indicators, areas, observations and parse runs.

pub mod areas;
pub mod indicators;
pub mod observations;
pub mod runs;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

const SCHEMA: &str = include_str!("../../schema.sql");

pub async fn connect(db_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(db_url)
        .await?;
    Ok(pool)
}

/// Drops every table and recreates the schema.
pub async fn recreate_schema(pool: &PgPool) -> Result<()> {
    info!("Recreating database schema");
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
