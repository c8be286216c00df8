//! Indicator repository.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Result, SurveyError};
use crate::hierarchy::IndicatorTree;
use crate::indicator::{normalize_code, Indicator, IndicatorType};

const COLUMNS: &str = "code, name, short_name, type, index_code, subindex_code, component_code, \
    description, units, provider_name, provider_url, source_name, source_url, source_data, \
    license, range, format_notes, tags, weight";

#[derive(Debug, sqlx::FromRow)]
struct IndicatorRow {
    code: String,
    name: String,
    short_name: Option<String>,
    #[sqlx(rename = "type")]
    kind: Option<String>,
    index_code: Option<String>,
    subindex_code: Option<String>,
    component_code: Option<String>,
    description: Option<String>,
    units: Option<String>,
    provider_name: Option<String>,
    provider_url: Option<String>,
    source_name: Option<String>,
    source_url: Option<String>,
    source_data: Option<String>,
    license: Option<String>,
    range: Option<String>,
    format_notes: Option<String>,
    tags: Option<String>,
    weight: Option<f64>,
}

impl TryFrom<IndicatorRow> for Indicator {
    type Error = SurveyError;

    fn try_from(row: IndicatorRow) -> Result<Self> {
        let kind = row.kind.as_deref().map(str::parse::<IndicatorType>).transpose()?;
        Ok(Indicator {
            code: row.code,
            name: row.name,
            short_name: row.short_name,
            kind,
            index_code: row.index_code,
            subindex_code: row.subindex_code,
            component_code: row.component_code,
            description: row.description,
            units: row.units,
            provider_name: row.provider_name,
            provider_url: row.provider_url,
            source_name: row.source_name,
            source_url: row.source_url,
            source_data: row.source_data,
            license: row.license,
            range: row.range,
            format_notes: row.format_notes,
            tags: row.tags,
            weight: row.weight,
        })
    }
}

fn into_indicators(rows: Vec<IndicatorRow>) -> Result<Vec<Indicator>> {
    rows.into_iter().map(Indicator::try_from).collect()
}

/// Upserts one indicator inside a caller-owned transaction. Orphans never
/// overwrite a typed indicator already stored under the same code.
pub async fn upsert(tx: &mut Transaction<'_, Postgres>, indicator: &Indicator) -> Result<()> {
    let conflict = if indicator.is_orphan() {
        "DO NOTHING"
    } else {
        "DO UPDATE SET name = EXCLUDED.name, short_name = EXCLUDED.short_name, type = EXCLUDED.type, \
         index_code = EXCLUDED.index_code, subindex_code = EXCLUDED.subindex_code, \
         component_code = EXCLUDED.component_code, description = EXCLUDED.description, \
         units = EXCLUDED.units, provider_name = EXCLUDED.provider_name, \
         provider_url = EXCLUDED.provider_url, source_name = EXCLUDED.source_name, \
         source_url = EXCLUDED.source_url, source_data = EXCLUDED.source_data, \
         license = EXCLUDED.license, range = EXCLUDED.range, format_notes = EXCLUDED.format_notes, \
         tags = EXCLUDED.tags, weight = EXCLUDED.weight"
    };
    let sql = format!(
        "INSERT INTO indicators ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
         ON CONFLICT (code) {conflict}"
    );
    sqlx::query(&sql)
        .bind(&indicator.code)
        .bind(&indicator.name)
        .bind(&indicator.short_name)
        .bind(indicator.kind.map(IndicatorType::as_str))
        .bind(&indicator.index_code)
        .bind(&indicator.subindex_code)
        .bind(&indicator.component_code)
        .bind(&indicator.description)
        .bind(&indicator.units)
        .bind(&indicator.provider_name)
        .bind(&indicator.provider_url)
        .bind(&indicator.source_name)
        .bind(&indicator.source_url)
        .bind(&indicator.source_data)
        .bind(&indicator.license)
        .bind(&indicator.range)
        .bind(&indicator.format_notes)
        .bind(&indicator.tags)
        .bind(indicator.weight)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Persists every indicator of the tree in one transaction.
pub async fn save_tree(pool: &PgPool, tree: &IndicatorTree) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for indicator in tree.iter() {
        upsert(&mut tx, indicator).await?;
    }
    tx.commit().await?;
    Ok(tree.len())
}

/// Loads every stored indicator, orphans included.
pub async fn load_tree(pool: &PgPool) -> Result<IndicatorTree> {
    let rows: Vec<IndicatorRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM indicators ORDER BY code"))
        .fetch_all(pool)
        .await?;
    let mut tree = IndicatorTree::new();
    for indicator in into_indicators(rows)? {
        tree.insert(indicator)?;
    }
    Ok(tree)
}

pub async fn find_by_code(pool: &PgPool, code: &str, kind: Option<IndicatorType>) -> Result<Indicator> {
    let code = normalize_code(code);
    let row: Option<IndicatorRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM indicators WHERE code = $1 AND ($2::text IS NULL OR type = $2)"
    ))
    .bind(&code)
    .bind(kind.map(IndicatorType::as_str))
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => row.try_into(),
        None => Err(SurveyError::indicator_not_found(code)),
    }
}

/// Direct children of `parent`, matched through the parent's link column.
pub async fn find_children(pool: &PgPool, parent: &Indicator) -> Result<Vec<Indicator>> {
    let Some(kind) = parent.kind else {
        return Ok(Vec::new());
    };
    let Some(column) = kind.link_column() else {
        return Ok(Vec::new());
    };
    let child_types: Vec<&str> = kind.child_types().iter().map(|k| k.as_str()).collect();
    let rows: Vec<IndicatorRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM indicators WHERE {column} = $1 AND type = ANY($2) ORDER BY code"
    ))
    .bind(&parent.code)
    .bind(child_types)
    .fetch_all(pool)
    .await?;
    into_indicators(rows)
}

/// All indicators of `kind`, optionally restricted to descendants of `parent`.
pub async fn find_by_level(
    pool: &PgPool,
    kind: IndicatorType,
    parent: Option<&Indicator>,
) -> Result<Vec<Indicator>> {
    let rows: Vec<IndicatorRow> = match parent {
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM indicators WHERE type = $1 ORDER BY code"
            ))
            .bind(kind.as_str())
            .fetch_all(pool)
            .await?
        }
        Some(parent) => {
            let Some(column) = parent.kind.and_then(IndicatorType::link_column) else {
                return Ok(Vec::new());
            };
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM indicators WHERE type = $1 AND {column} = $2 ORDER BY code"
            ))
            .bind(kind.as_str())
            .bind(&parent.code)
            .fetch_all(pool)
            .await?
        }
    };
    into_indicators(rows)
}
