//! Parser Service - Loads survey workbooks into the observation store
//!
//! Responsibilities:
//! - Parse the indicator hierarchy and the areas from the structure workbook
//! - Resolve raw, structure and dataset sheets into ranked observations
//! - Flush each sheet family in one transaction
//! - Compute rank changes once every year is stored
//! - Record the run in parse_runs
//!
//! A structural problem aborts the sheet it was found in, never the run;
//! the process still exits non-zero so the failure is visible.

mod areas;
mod classifier;
mod config;
mod error;
mod indicators;
mod resolver;
mod workbook;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use sqlx::PgPool;
use survey::db::observations::PgObservationStore;
use survey::{
    AreaIndex, Indicator, IndicatorTree, MemoryObservationStore, ObservationStore, SheetFamily,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::classifier::ClassifierSet;
use crate::config::ParserConfig;
use crate::resolver::{FamilyOutcome, Resolver};
use crate::workbook::{Sheet, Workbook};

#[derive(Parser, Debug)]
#[command(name = "parser", about = "Loads survey workbooks into the observation store")]
struct Args {
    /// Layout configuration (JSON)
    #[arg(long, default_value = "config/parser.json")]
    config: PathBuf,

    /// Drop and recreate every table before loading
    #[arg(long, default_value = "false")]
    recreate: bool,

    /// Dry run - resolve into memory, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Reuse the indicators and areas already stored
    #[arg(long, default_value = "false")]
    skip_structure: bool,
}

/// Per-family figures stored in the run detail.
#[derive(Debug, Serialize)]
struct FamilySummary {
    family: String,
    sheets: usize,
    observations: usize,
    inserted: usize,
    rejected: usize,
    duplicates: usize,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    families: Vec<FamilySummary>,
    sheet_errors: Vec<String>,
    orphans: usize,
    skipped_rows: usize,
    rank_changes: u64,
    stored: u64,
}

// =============================================================================
// Workbooks
// =============================================================================

/// Every workbook the run needs, opened once per distinct path.
fn open_workbooks(config: &ParserConfig, skip_structure: bool) -> Result<BTreeMap<PathBuf, Workbook>> {
    let mut paths = vec![config.raw_observations.file.clone(), config.structure_observations.file.clone()];
    if let Some(dataset) = &config.dataset_observations {
        paths.push(dataset.file.clone());
    }
    if !skip_structure {
        paths.push(config.structure_access.file.clone());
        paths.push(config.area_access.file.clone());
    }

    let mut workbooks = BTreeMap::new();
    for path in paths {
        if workbooks.contains_key(&path) {
            continue;
        }
        info!("Opening workbook {}", path.display());
        let workbook = Workbook::open(&path)?;
        workbooks.insert(path, workbook);
    }
    Ok(workbooks)
}

fn workbook<'w>(workbooks: &'w BTreeMap<PathBuf, Workbook>, path: &Path) -> Result<&'w Workbook> {
    workbooks
        .get(path)
        .with_context(|| format!("Workbook {} was not opened", path.display()))
}

// =============================================================================
// Structure
// =============================================================================

async fn load_structure(
    pool: Option<&PgPool>,
    config: &ParserConfig,
    workbooks: &BTreeMap<PathBuf, Workbook>,
    skip_structure: bool,
) -> Result<(IndicatorTree, AreaIndex)> {
    if skip_structure {
        let pool = pool.context("--skip-structure needs the database")?;
        info!("Loading indicators and areas from the database");
        let tree = survey::db::indicators::load_tree(pool).await?;
        let areas = survey::db::areas::load_index(pool).await?;
        return Ok((tree, areas));
    }

    let tree = indicators::parse_indicators(
        workbook(workbooks, &config.structure_access.file)?,
        &config.structure_access,
    )?;
    let areas = areas::parse_areas(
        workbook(workbooks, &config.area_access.file)?,
        &config.area_access,
        &config.regions,
    )?;

    if let Some(pool) = pool {
        let saved = survey::db::indicators::save_tree(pool, &tree).await?;
        info!("Saved {} indicators", saved);
        let saved = survey::db::areas::save_all(pool, &areas).await?;
        info!("Saved {} areas", saved);
    }
    Ok((tree, areas))
}

async fn save_orphans(pool: &PgPool, orphans: &[Indicator]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for orphan in orphans {
        survey::db::indicators::upsert(&mut tx, orphan).await?;
    }
    tx.commit().await?;
    Ok(())
}

// =============================================================================
// Observations
// =============================================================================

fn resolve_families(
    resolver: &mut Resolver<'_>,
    config: &ParserConfig,
    workbooks: &BTreeMap<PathBuf, Workbook>,
) -> Result<Vec<FamilyOutcome>> {
    let mut outcomes = Vec::new();

    let raw = &config.raw_observations;
    let raw_sheets: Vec<&Sheet> = workbook(workbooks, &raw.file)?.sheets_matching(&raw.layout.sheet_regex()?);
    let year = raw.layout.year_regex()?;
    outcomes.push(resolver.resolve_family(SheetFamily::Raw, &raw_sheets, |r, s| {
        r.resolve_raw_sheet(s, &raw.layout, &year)
    }));

    let structure = &config.structure_observations;
    let classifiers = ClassifierSet::from_config(structure)?;
    let structure_sheets: Vec<&Sheet> =
        workbook(workbooks, &structure.file)?.sheets_matching(&structure.layout.sheet_regex()?);
    let year = structure.layout.year_regex()?;
    outcomes.push(resolver.resolve_family(SheetFamily::Structure, &structure_sheets, |r, s| {
        r.resolve_structure_sheet(s, &structure.layout, &year, &classifiers)
    }));

    if let Some(dataset) = &config.dataset_observations {
        let dataset_sheets: Vec<&Sheet> =
            workbook(workbooks, &dataset.file)?.sheets_matching(&dataset.layout.sheet_regex()?);
        let year = dataset.layout.year_regex()?;
        outcomes.push(resolver.resolve_family(SheetFamily::Dataset, &dataset_sheets, |r, s| {
            r.resolve_dataset_sheet(s, dataset, &year)
        }));
    }
    Ok(outcomes)
}

/// Flushes every family, then runs the rank-change pass over the store.
async fn store_observations<S: ObservationStore>(
    store: &mut S,
    outcomes: Vec<FamilyOutcome>,
    summary: &mut RunSummary,
) -> Result<()> {
    for outcome in outcomes {
        summary
            .sheet_errors
            .extend(outcome.sheet_errors.iter().map(|e| e.to_string()));
        let observations = outcome.batch.len();
        let report = match store.flush(outcome.family, outcome.batch.into_vec()).await {
            Ok(report) => report,
            Err(e) => {
                error!("Flush of {} observations failed: {}", outcome.family, e);
                return Err(e.into());
            }
        };
        info!(
            "{}: {} sheets, {} observations, {} inserted, {} rejected",
            outcome.family,
            outcome.sheets_resolved,
            observations,
            report.inserted,
            report.rejected.len()
        );
        summary.families.push(FamilySummary {
            family: outcome.family.to_string(),
            sheets: outcome.sheets_resolved,
            observations,
            inserted: report.inserted,
            rejected: report.rejected.len(),
            duplicates: outcome.duplicates,
        });
    }

    info!("Computing rank changes");
    summary.rank_changes = store.update_rank_changes().await?;
    summary.stored = store.count().await?;
    Ok(())
}

async fn run(args: &Args, config: &ParserConfig, pool: Option<&PgPool>) -> Result<RunSummary> {
    let workbooks = open_workbooks(config, args.skip_structure)?;
    let (tree, areas) = load_structure(pool, config, &workbooks, args.skip_structure).await?;
    info!("Hierarchy: {} indicators, {} areas", tree.len(), areas.len());

    let mut resolver = Resolver::new(&tree, &areas, config.ranking);
    let outcomes = resolve_families(&mut resolver, config, &workbooks)?;
    let orphans: Vec<Indicator> = resolver.orphans().cloned().collect();
    let counts = resolver.counts();

    let mut summary = RunSummary {
        orphans: orphans.len(),
        skipped_rows: counts.skipped_rows,
        ..Default::default()
    };
    if !orphans.is_empty() {
        warn!("{} indicators referenced by data are not in the hierarchy", orphans.len());
    }

    match pool {
        Some(pool) => {
            save_orphans(pool, &orphans).await?;
            let mut store = PgObservationStore::new(pool.clone());
            store_observations(&mut store, outcomes, &mut summary).await?;
        }
        None => {
            let mut store = MemoryObservationStore::new();
            store_observations(&mut store, outcomes, &mut summary).await?;
            println!("\nDry run - no observations saved to database");
        }
    }
    Ok(summary)
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
    let config = ParserConfig::from_file(&args.config)?;

    println!("=== Survey Parser ===");
    println!("Config: {}", args.config.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pool = if args.dry_run {
        None
    } else {
        let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
        let pool = survey::db::connect(&db_url, 5)
            .await
            .context("Failed to connect to database")?;
        if args.recreate {
            survey::db::recreate_schema(&pool).await?;
        }
        Some(pool)
    };

    let run_id: Option<Uuid> = match &pool {
        Some(pool) => Some(
            survey::db::runs::create_parse_run(
                pool,
                serde_json::json!({ "config": args.config.display().to_string() }),
            )
            .await?,
        ),
        None => None,
    };

    let started = Utc::now();
    let result = run(&args, &config, pool.as_ref()).await;
    let elapsed = (Utc::now() - started).num_milliseconds();

    if let (Some(pool), Some(run_id)) = (&pool, run_id) {
        match &result {
            Ok(summary) => {
                let status = if summary.sheet_errors.is_empty() { "ok" } else { "partial" };
                let mut detail = serde_json::to_value(summary)?;
                detail["elapsed_ms"] = serde_json::json!(elapsed);
                survey::db::runs::finish_parse_run(pool, run_id, status, None, detail).await?;
            }
            Err(e) => {
                survey::db::runs::finish_parse_run(
                    pool,
                    run_id,
                    "failed",
                    Some(&e.to_string()),
                    serde_json::json!({ "elapsed_ms": elapsed }),
                )
                .await?;
            }
        }
    }

    let summary = result?;
    println!("\n=== Parsing Complete ===");
    for family in &summary.families {
        println!(
            "{}: {} sheets, {} inserted, {} rejected, {} duplicates",
            family.family, family.sheets, family.inserted, family.rejected, family.duplicates
        );
    }
    println!("Orphan indicators: {}", summary.orphans);
    println!("Skipped rows: {}", summary.skipped_rows);
    println!("Rank changes: {}", summary.rank_changes);
    println!("Observations stored: {}", summary.stored);

    if !summary.sheet_errors.is_empty() {
        for e in &summary.sheet_errors {
            error!("{}", e);
        }
        anyhow::bail!("{} sheets could not be parsed", summary.sheet_errors.len());
    }
    Ok(())
}
