//! Static JSON documents for the web front end, built from the same views the
//! API serves. Each document holds the bare `data` payload, without the
//! response envelope.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use survey::{db, Area};
use tracing::{debug, info};

use crate::{
    country_observations, flattened, index_observations, index_stats, meta_indicators, years_with_data, AppState,
};

pub fn year_document(year: i32) -> String {
    format!("odb_{}.json", year)
}

pub fn country_document(iso3: &str) -> String {
    format!("odb_{}.json", iso3)
}

async fn write_document<T: Serialize>(dir: &Path, name: &str, data: &T) -> Result<PathBuf> {
    let path = dir.join(name);
    let body = serde_json::to_vec(data).with_context(|| format!("Failed to serialize {}", name))?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

fn by_name(mut areas: Vec<Area>) -> Vec<Area> {
    areas.sort_by(|a, b| a.name.cmp(&b.name));
    areas
}

/// Writes every document into `out_dir`, creating it when missing. Returns
/// the number of files written.
pub async fn export_all(state: &AppState, out_dir: &Path) -> Result<usize> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let mut written = 0;

    info!("Exporting indicators");
    let tree = db::indicators::load_tree(&state.pool).await?;
    write_document(out_dir, "indicators.json", &flattened(&tree)?).await?;
    write_document(out_dir, "indicators_meta.json", &meta_indicators(&tree)?).await?;
    written += 2;

    info!("Exporting areas");
    let areas = db::areas::load_index(&state.pool).await?;
    let countries = by_name(areas.countries().cloned().collect());
    write_document(out_dir, "countries.json", &countries).await?;
    write_document(out_dir, "regions.json", &by_name(areas.regions().cloned().collect())).await?;
    written += 2;

    let years = db::observations::available_years(&state.pool).await?;
    let mut stats = BTreeMap::new();
    for year in &years {
        info!("Exporting {}", year);
        write_document(out_dir, &year_document(*year), &index_observations(state, *year).await?).await?;
        stats.insert(*year, index_stats(state, &year.to_string()).await?);
        written += 1;
    }
    write_document(out_dir, "stats.json", &stats).await?;
    write_document(out_dir, "years_with_data.json", &years_with_data(state).await?).await?;
    written += 2;

    for country in &countries {
        debug!("Exporting {}", country.iso3);
        let observations = country_observations(state, &country.iso3).await?;
        write_document(out_dir, &country_document(&country.iso3), &observations).await?;
        written += 1;
    }
    info!("Exported {} countries", countries.len());

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_names() {
        assert_eq!(year_document(2015), "odb_2015.json");
        assert_eq!(country_document("KEN"), "odb_KEN.json");
    }

    #[test]
    fn test_areas_sorted_by_name() {
        let sorted = by_name(vec![
            Area::country("ESP", "ES", "Spain", None),
            Area::country("FRA", "FR", "France", None),
            Area::country("KEN", "KE", "Kenya", None),
        ]);
        let names: Vec<&str> = sorted.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["France", "Kenya", "Spain"]);
    }

    #[tokio::test]
    async fn test_write_document_stores_bare_payload() {
        let dir = std::env::temp_dir().join(format!("survey-export-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut by_year = BTreeMap::new();
        by_year.insert(2015, vec!["ODB".to_string()]);
        let path = write_document(&dir, "years_with_data.json", &by_year).await.unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({ "2015": ["ODB"] }));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
