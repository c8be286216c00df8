//! Enricher Service - Attaches external country data to stored areas
//!
//! Responsibilities:
//! - Fetch the latest World Bank value of each configured indicator per country
//! - Apply rate limiting and retries to avoid degrading the source API
//! - Load optional search text per country from a JSON file
//! - Write everything in one transaction
//!
//! Usage:
//!   cargo run --bin enricher -- --indicators SP.POP.TOTL,IT.NET.USER.ZS
//!   cargo run --bin enricher -- --indicators "" --search-data search.json

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use sqlx::PgPool;
use survey::db::areas::AreaInfo;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "enricher", about = "Enriches areas with World Bank values and search data")]
struct Args {
    /// World Bank indicator codes, comma separated
    #[arg(long, value_delimiter = ',', default_value = "SP.POP.TOTL,NY.GDP.PCAP.PP.CD,IT.NET.USER.ZS")]
    indicators: Vec<String>,

    /// JSON object mapping iso3 codes to search text
    #[arg(long)]
    search_data: Option<PathBuf>,

    /// Dry run - fetch and report, don't write to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    rate_limit_ms: u64,
    max_attempts: u32,
    indicator_url: String,
    provider_name: String,
    provider_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            max_attempts: std::env::var("FETCH_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            indicator_url: std::env::var("WB_INDICATOR_URL").unwrap_or_else(|_| {
                "https://api.worldbank.org/v2/country/{ISO3}/indicator/{INDICATOR_CODE}".to_string()
            }),
            provider_name: std::env::var("WB_PROVIDER_NAME").unwrap_or_else(|_| "World Bank".to_string()),
            provider_url: std::env::var("WB_PROVIDER_URL").unwrap_or_else(|_| {
                "https://data.worldbank.org/indicator/{INDICATOR_CODE}".to_string()
            }),
        })
    }
}

// =============================================================================
// World Bank
// =============================================================================

fn expand(pattern: &str, iso3: &str, indicator: &str) -> String {
    pattern
        .replace("{ISO3}", iso3)
        .replace("{INDICATOR_CODE}", indicator)
}

/// Stored code for a World Bank indicator: dots are not allowed in keys.
fn info_code(indicator: &str) -> String {
    indicator.trim().replace('.', "_")
}

/// The most recent non-null entry of a `[meta, [{date, value}, ...]]` body.
/// The series is ordered newest first.
fn latest_value(body: &Value) -> Option<(Option<i32>, f64)> {
    body.get(1)?
        .as_array()?
        .iter()
        .find_map(|entry| {
            let value = entry.get("value")?.as_f64()?;
            let year = entry
                .get("date")
                .and_then(Value::as_str)
                .and_then(|d| d.trim().parse().ok());
            Some((year, value))
        })
}

async fn get_json(client: &reqwest::Client, config: &Config, url: &str) -> Result<Value> {
    let mut attempt = 0;
    loop {
        sleep(Duration::from_millis(config.rate_limit_ms)).await;
        attempt += 1;
        let response = client
            .get(url)
            .query(&[("format", "json"), ("per_page", "100")])
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match response {
            Ok(response) => return response.json().await.context("Invalid JSON response"),
            Err(e) if attempt < config.max_attempts => {
                warn!("Request to {} failed (attempt {}): {}", url, attempt, e);
            }
            Err(e) => return Err(e).with_context(|| format!("HTTP request failed: {}", url)),
        }
    }
}

async fn fetch_area_info(
    client: &reqwest::Client,
    config: &Config,
    countries: &[String],
    indicators: &[String],
) -> Result<Vec<AreaInfo>> {
    let mut collected = Vec::new();
    for indicator in indicators.iter().map(|i| i.trim()).filter(|i| !i.is_empty()) {
        info!("Retrieving {} from {}", indicator, config.provider_name);
        let provider_url = expand(&config.provider_url, "", indicator);
        for iso3 in countries {
            let url = expand(&config.indicator_url, iso3, indicator);
            let body = match get_json(client, config, &url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("{}: {:#}", iso3, e);
                    continue;
                }
            };
            match latest_value(&body) {
                Some((year, value)) => collected.push(AreaInfo {
                    area_code: iso3.clone(),
                    indicator_code: info_code(indicator),
                    year,
                    value: Some(value),
                    provider_name: Some(config.provider_name.clone()),
                    provider_url: Some(provider_url.clone()),
                }),
                None => warn!("{} has no values for {}", iso3, indicator),
            }
        }
    }
    Ok(collected)
}

// =============================================================================
// Search data
// =============================================================================

fn parse_search_data(content: &str) -> Result<BTreeMap<String, String>> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(content).context("Failed to parse search data")?;
    Ok(raw
        .into_iter()
        .map(|(iso3, search)| {
            let text = match search {
                Value::String(s) => s,
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                other => other.to_string(),
            };
            (iso3.trim().to_uppercase(), text)
        })
        .collect())
}

async fn write_all(pool: &PgPool, info: &[AreaInfo], search: &BTreeMap<String, String>) -> Result<(usize, usize)> {
    let mut tx = pool.begin().await?;
    for entry in info {
        survey::db::areas::upsert_info(&mut tx, entry).await?;
    }
    let mut updated = 0;
    for (iso3, text) in search {
        if survey::db::areas::update_search(&mut tx, iso3, text).await? {
            updated += 1;
        } else {
            warn!("Search data for unknown area {}", iso3);
        }
    }
    tx.commit().await?;
    Ok((info.len(), updated))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Survey Area Enricher ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent("survey-enricher/0.1")
        .build()?;

    let pool = survey::db::connect(&config.db_url, 5)
        .await
        .context("Failed to connect to database")?;

    let areas = survey::db::areas::load_index(&pool).await?;
    let countries: Vec<String> = areas.countries().map(|a| a.iso3.clone()).collect();
    info!("{} countries to enrich", countries.len());

    let info = fetch_area_info(&client, &config, &countries, &args.indicators).await?;
    info!("Retrieved {} values", info.len());

    let search = match &args.search_data {
        Some(path) => {
            info!("Reading search data from {}", path.display());
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            parse_search_data(&content)?
        }
        None => BTreeMap::new(),
    };

    if args.dry_run {
        println!("\nDry run - {} values and {} search entries not saved", info.len(), search.len());
        return Ok(());
    }

    let (values, searches) = write_all(&pool, &info, &search).await?;
    println!("\n=== Enrichment Complete ===");
    println!("Values upserted: {}", values);
    println!("Search entries updated: {}", searches);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_value_skips_nulls() {
        let body = json!([
            { "page": 1, "pages": 1 },
            [
                { "date": "2016", "value": null },
                { "date": "2015", "value": 57.8 },
                { "date": "2014", "value": 55.1 }
            ]
        ]);
        assert_eq!(latest_value(&body), Some((Some(2015), 57.8)));
    }

    #[test]
    fn test_latest_value_without_data() {
        let all_null = json!([{}, [{ "date": "2016", "value": null }]]);
        assert_eq!(latest_value(&all_null), None);
        // the API answers unknown countries with a message object only
        let error = json!([{ "message": [{ "id": "120", "value": "Invalid value" }] }]);
        assert_eq!(latest_value(&error), None);
    }

    #[test]
    fn test_info_code_and_urls() {
        assert_eq!(info_code("SP.POP.TOTL"), "SP_POP_TOTL");
        assert_eq!(
            expand(
                "https://api.worldbank.org/v2/country/{ISO3}/indicator/{INDICATOR_CODE}",
                "KEN",
                "IT.NET.USER.ZS"
            ),
            "https://api.worldbank.org/v2/country/KEN/indicator/IT.NET.USER.ZS"
        );
    }

    #[test]
    fn test_parse_search_data() {
        let search = parse_search_data(r#"{ "fra": "France Francia", "KEN": ["Kenya", "Kenia"] }"#).unwrap();
        assert_eq!(search["FRA"], "France Francia");
        assert_eq!(search["KEN"], "Kenya Kenia");
        assert!(parse_search_data("[1, 2]").is_err());
    }
}
