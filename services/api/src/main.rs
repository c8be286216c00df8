//! API Service - Read-only REST API over the survey store
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /areas[/countries|/regions|/:code] - Areas and their enrichment values
//! - GET /indicators[/index|/subindices|/components|/primary|/secondary|/:code]
//! - GET /indicators/:code/indicators - Descendants of an indicator
//! - GET /observations[/:indicator[/:area[/:year]]]?level= - Ranked observations
//! - GET /statistics[/:indicator[/:area[/:year]]]?level= - Mean/median per region
//! - GET /years - Years with data
//! - GET /indexObservations/:year, /indexStats/:year, /indexEvolution/:year
//! - GET /countryObservations/:area
//! - GET /visualisations[/:indicator[/:area[/:year]]] - Observations with statistics
//! - GET /visualisationsGroupedByArea[/:indicator[/:area[/:year]]]
//! - GET /indicators_flattened, /indicators_meta, /areasInfo, /yearsWithIndicatorData
//!
//! Every response is wrapped as `{"success": true, "data": ...}` or
//! `{"success": false, "error": "..."}`.
//!
//! Usage:
//!   cargo run --bin api
//!   cargo run --bin api -- --export json/

mod cache;
mod export;
mod views;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use survey::db;
use survey::query::{ObservationFilter, ObservationQuery, TreeLevel, ALL};
use survey::stats::{compute_statistics, Statistics, StatisticsTable};
use survey::{Area, AreaIndex, Indicator, IndicatorTree, IndicatorType, Observation, SurveyError};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cache::ResponseCache;
use crate::views::{CountryObservations, GroupedVisualisation, IndexEvolution, IndexObservations, Visualisation};

#[derive(Parser, Debug)]
#[command(name = "api", about = "Read-only REST API over the survey store")]
struct Args {
    /// Write the static JSON documents to this directory instead of serving
    #[arg(long)]
    export: Option<PathBuf>,
}

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    started_at: DateTime<Utc>,
}

impl AppState {
    async fn snapshot(&self) -> Result<(IndicatorTree, AreaIndex), SurveyError> {
        let tree = db::indicators::load_tree(&self.pool).await?;
        let areas = db::areas::load_index(&self.pool).await?;
        Ok((tree, areas))
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct ApiError(SurveyError);

impl From<SurveyError> for ApiError {
    fn from(e: SurveyError) -> Self {
        Self(e)
    }
}

fn status_for(e: &SurveyError) -> StatusCode {
    if e.is_bad_request() {
        StatusCode::BAD_REQUEST
    } else if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("{}", self.0);
        }
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    }))
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize, Default)]
struct ObservationPath {
    indicator: Option<String>,
    area: Option<String>,
    year: Option<String>,
}

#[derive(Deserialize, Default)]
struct ObservationParams {
    level: Option<String>,
    #[serde(default)]
    datasets: bool,
}

#[derive(Deserialize, Default)]
struct LevelParams {
    /// Restrict to descendants of this indicator.
    parent: Option<String>,
}

fn parse_year(raw: &str) -> Result<i32, SurveyError> {
    raw.trim()
        .parse()
        .map_err(|_| SurveyError::InvalidYearFilter(raw.to_string()))
}

fn observation_query(
    path: Option<Path<ObservationPath>>,
    params: &ObservationParams,
) -> Result<ObservationQuery, SurveyError> {
    let path = path.map(|Path(p)| p).unwrap_or_default();
    let level = params.level.as_deref().map(TreeLevel::from_str).transpose()?;
    let query = ObservationQuery::new(
        path.indicator.as_deref().unwrap_or(ALL),
        path.area.as_deref().unwrap_or(ALL),
        path.year.as_deref().unwrap_or(ALL),
    )
    .with_level(level);
    Ok(if params.datasets { query.with_datasets() } else { query })
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    started_at: DateTime<Utc>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
    })
}

// --- areas ------------------------------------------------------------------

async fn areas_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Area>> {
    let areas = db::areas::load_index(&state.pool).await?;
    ok(areas.iter().cloned().collect())
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Area>> {
    let areas = db::areas::load_index(&state.pool).await?;
    ok(areas.countries().cloned().collect())
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Area>> {
    let areas = db::areas::load_index(&state.pool).await?;
    ok(areas.regions().cloned().collect())
}

#[derive(Serialize)]
struct AreaDetail {
    #[serde(flatten)]
    area: Area,
    info: Vec<db::areas::AreaInfo>,
    countries: Vec<Area>,
}

async fn area_handler(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> ApiResult<AreaDetail> {
    let areas = db::areas::load_index(&state.pool).await?;
    let area = areas.find_by_code(&code)?.clone();
    let info = db::areas::find_info(&state.pool, &area.iso3).await?;
    let countries = if area.is_region() {
        areas.countries_in(&area.iso3).cloned().collect()
    } else {
        Vec::new()
    };
    ok(AreaDetail { area, info, countries })
}

// --- indicators -------------------------------------------------------------

async fn indicator_tree_handler(State(state): State<Arc<AppState>>) -> ApiResult<survey::IndicatorNode> {
    let tree = db::indicators::load_tree(&state.pool).await?;
    ok(tree.tree()?)
}

async fn indicators_of(state: &AppState, kind: IndicatorType, params: LevelParams) -> ApiResult<Vec<Indicator>> {
    let parent = match params.parent {
        Some(code) => Some(db::indicators::find_by_code(&state.pool, &code, None).await?),
        None => None,
    };
    ok(db::indicators::find_by_level(&state.pool, kind, parent.as_ref()).await?)
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(params): Query<LevelParams>) -> ApiResult<Vec<Indicator>> {
    indicators_of(&state, IndicatorType::Index, params).await
}

async fn subindices_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LevelParams>,
) -> ApiResult<Vec<Indicator>> {
    indicators_of(&state, IndicatorType::Subindex, params).await
}

async fn components_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LevelParams>,
) -> ApiResult<Vec<Indicator>> {
    indicators_of(&state, IndicatorType::Component, params).await
}

async fn primary_handler(State(state): State<Arc<AppState>>, Query(params): Query<LevelParams>) -> ApiResult<Vec<Indicator>> {
    indicators_of(&state, IndicatorType::Primary, params).await
}

async fn secondary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LevelParams>,
) -> ApiResult<Vec<Indicator>> {
    indicators_of(&state, IndicatorType::Secondary, params).await
}

async fn indicator_handler(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> ApiResult<Indicator> {
    ok(db::indicators::find_by_code(&state.pool, &code, None).await?)
}

async fn indicator_children_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<Indicator>> {
    let parent = db::indicators::find_by_code(&state.pool, &code, None).await?;
    ok(db::indicators::find_children(&state.pool, &parent).await?)
}

async fn indicator_descendants_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<survey::IndicatorNode>> {
    let tree = db::indicators::load_tree(&state.pool).await?;
    let parent = tree.find_by_code(&code, None)?;
    ok(tree.find_children_recursive(parent))
}

async fn indicators_below(state: &AppState, code: &str, kind: IndicatorType) -> ApiResult<Vec<Indicator>> {
    let parent = db::indicators::find_by_code(&state.pool, code, None).await?;
    ok(db::indicators::find_by_level(&state.pool, kind, Some(&parent)).await?)
}

async fn indicator_primary_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<Indicator>> {
    indicators_below(&state, &code, IndicatorType::Primary).await
}

async fn indicator_secondary_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<Indicator>> {
    indicators_below(&state, &code, IndicatorType::Secondary).await
}

/// The tree in pre-order, without nesting.
fn flattened(tree: &IndicatorTree) -> Result<Vec<Indicator>, SurveyError> {
    Ok(tree.tree()?.flatten().into_iter().cloned().collect())
}

/// Indicators outside the tree, such as the dataset assessment ones.
fn meta_indicators(tree: &IndicatorTree) -> Result<Vec<Indicator>, SurveyError> {
    Ok(tree.detached()?.into_iter().cloned().collect())
}

async fn indicators_flattened_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Indicator>> {
    let tree = db::indicators::load_tree(&state.pool).await?;
    ok(flattened(&tree)?)
}

async fn indicators_meta_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Indicator>> {
    let tree = db::indicators::load_tree(&state.pool).await?;
    ok(meta_indicators(&tree)?)
}

async fn areas_info_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<views::IndicatorInfo>> {
    let rows = db::areas::all_info(&state.pool).await?;
    ok(views::areas_info(rows))
}

// --- observations -----------------------------------------------------------

async fn find_observations(
    state: &AppState,
    query: &ObservationQuery,
) -> Result<(Vec<Observation>, AreaIndex), SurveyError> {
    let (tree, areas) = state.snapshot().await?;
    let years = db::observations::available_years(&state.pool).await?;
    let filter = query.resolve(&tree, &areas, &years)?;
    let observations = db::observations::find(&state.pool, &filter).await?;
    Ok((observations, areas))
}

async fn observations_handler(
    State(state): State<Arc<AppState>>,
    path: Option<Path<ObservationPath>>,
    Query(params): Query<ObservationParams>,
) -> ApiResult<Vec<Observation>> {
    let query = observation_query(path, &params)?;
    let (observations, _) = find_observations(&state, &query).await?;
    ok(observations)
}

async fn statistics_handler(
    State(state): State<Arc<AppState>>,
    path: Option<Path<ObservationPath>>,
    Query(params): Query<ObservationParams>,
) -> ApiResult<StatisticsTable> {
    let query = observation_query(path, &params)?;
    let (observations, areas) = find_observations(&state, &query).await?;
    ok(compute_statistics(&observations, &areas))
}

/// A query's observations, the same query over every area, and the countries
/// the query selected.
struct Comparison {
    observations: Vec<Observation>,
    all_areas: Vec<Observation>,
    countries: Vec<String>,
    areas: AreaIndex,
}

async fn compare_with_all_areas(state: &AppState, query: &ObservationQuery) -> Result<Comparison, SurveyError> {
    let (tree, areas) = state.snapshot().await?;
    let years = db::observations::available_years(&state.pool).await?;
    let filter = query.resolve(&tree, &areas, &years)?;
    let observations = db::observations::find(&state.pool, &filter).await?;
    let (all_areas, countries) = match filter.area_codes.clone() {
        None => (
            observations.clone(),
            areas.countries().map(|a| a.iso3.clone()).collect(),
        ),
        Some(countries) => {
            let unrestricted = ObservationFilter {
                area_codes: None,
                ..filter
            };
            (db::observations::find(&state.pool, &unrestricted).await?, countries)
        }
    };
    Ok(Comparison {
        observations,
        all_areas,
        countries,
        areas,
    })
}

async fn visualisations_handler(
    State(state): State<Arc<AppState>>,
    path: Option<Path<ObservationPath>>,
    Query(params): Query<ObservationParams>,
) -> ApiResult<Visualisation> {
    let query = observation_query(path, &params)?;
    let found = compare_with_all_areas(&state, &query).await?;
    ok(views::visualisation(found.observations, &found.all_areas, &found.areas))
}

async fn grouped_visualisations_handler(
    State(state): State<Arc<AppState>>,
    path: Option<Path<ObservationPath>>,
    Query(params): Query<ObservationParams>,
) -> ApiResult<GroupedVisualisation> {
    let query = observation_query(path, &params)?;
    let found = compare_with_all_areas(&state, &query).await?;
    ok(views::grouped_visualisation(
        &found.countries,
        found.observations,
        &found.all_areas,
        &found.areas,
    ))
}

async fn years_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<views::YearEntry>> {
    let pairs = db::observations::years_with_indicators(&state.pool).await?;
    ok(views::years_listing(pairs))
}

async fn years_with_data(state: &AppState) -> Result<BTreeMap<i32, Vec<String>>, SurveyError> {
    let pairs = db::observations::years_with_indicators(&state.pool).await?;
    Ok(views::indicators_by_year(pairs))
}

async fn years_with_data_handler(State(state): State<Arc<AppState>>) -> ApiResult<BTreeMap<i32, Vec<String>>> {
    ok(years_with_data(&state).await?)
}

/// The INDEX and its subindices and components for one year, all countries.
async fn index_year_observations(state: &AppState, year: &str) -> Result<(Vec<Observation>, AreaIndex), SurveyError> {
    let query = ObservationQuery::new(ALL, ALL, year).with_level(Some(TreeLevel::Component));
    find_observations(state, &query).await
}

async fn index_observations(state: &AppState, year: i32) -> Result<IndexObservations, SurveyError> {
    let (observations, areas) = index_year_observations(state, &year.to_string()).await?;
    let statistics = compute_statistics(&observations, &areas);
    Ok(IndexObservations {
        year,
        observations,
        statistics,
    })
}

async fn index_observations_handler(
    State(state): State<Arc<AppState>>,
    Path(year): Path<String>,
) -> ApiResult<IndexObservations> {
    ok(index_observations(&state, parse_year(&year)?).await?)
}

type AreaStatistics = BTreeMap<String, BTreeMap<String, Statistics>>;

async fn index_stats(state: &AppState, year: &str) -> Result<AreaStatistics, SurveyError> {
    let (observations, areas) = index_year_observations(state, year).await?;
    Ok(views::statistics_by_area(compute_statistics(&observations, &areas)))
}

async fn index_stats_handler(State(state): State<Arc<AppState>>, Path(year): Path<String>) -> ApiResult<AreaStatistics> {
    ok(index_stats(&state, &year).await?)
}

async fn index_evolution_handler(
    State(state): State<Arc<AppState>>,
    Path(year): Path<String>,
) -> ApiResult<IndexEvolution> {
    let year = parse_year(&year)?;
    let (tree, areas) = state.snapshot().await?;
    let years = db::observations::available_years(&state.pool).await?;
    let filter = ObservationQuery::new(ALL, ALL, ALL)
        .with_level(Some(TreeLevel::Component))
        .resolve(&tree, &areas, &years)?;
    let observations = db::observations::find(&state.pool, &filter).await?;
    ok(views::index_evolution(year, &tree.index()?.code, observations, &areas))
}

async fn country_observations_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<CountryObservations> {
    ok(country_observations(&state, &code).await?)
}

async fn country_observations(state: &AppState, code: &str) -> Result<CountryObservations, SurveyError> {
    let (tree, areas) = state.snapshot().await?;
    let area = areas.find_by_code(code)?.clone();
    let years = db::observations::available_years(&state.pool).await?;

    let own = ObservationQuery::new(ALL, &area.iso3, ALL)
        .with_datasets()
        .resolve(&tree, &areas, &years)?;
    let country = db::observations::find(&state.pool, &own).await?;

    let mut codes: Vec<String> = country
        .iter()
        .filter(|o| !o.is_dataset())
        .map(|o| o.indicator_code.clone())
        .collect();
    codes.sort();
    codes.dedup();
    let mut peers_filter = ObservationQuery::new(ALL, ALL, ALL).resolve(&tree, &areas, &years)?;
    peers_filter.indicator_codes = Some(codes);
    let peers = db::observations::find(&state.pool, &peers_filter).await?;

    Ok(CountryObservations {
        years: views::country_years(country, &peers, &areas),
        area,
    })
}

// ============================================================================
// Main
// ============================================================================

fn router(state: Arc<AppState>, cache: ResponseCache) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/areas", get(areas_handler))
        .route("/areas/countries", get(countries_handler))
        .route("/areas/regions", get(regions_handler))
        .route("/areas/:code", get(area_handler))
        .route("/indicators", get(indicator_tree_handler))
        .route("/indicators/index", get(index_handler))
        .route("/indicators/subindices", get(subindices_handler))
        .route("/indicators/components", get(components_handler))
        .route("/indicators/primary", get(primary_handler))
        .route("/indicators/secondary", get(secondary_handler))
        .route("/indicators/:code", get(indicator_handler))
        .route("/indicators/:code/children", get(indicator_children_handler))
        .route("/indicators/:code/indicators", get(indicator_descendants_handler))
        .route("/indicators/:code/primary", get(indicator_primary_handler))
        .route("/indicators/:code/secondary", get(indicator_secondary_handler))
        .route("/indicators_flattened", get(indicators_flattened_handler))
        .route("/indicators_meta", get(indicators_meta_handler))
        .route("/areasInfo", get(areas_info_handler))
        .route("/observations", get(observations_handler))
        .route("/observations/:indicator", get(observations_handler))
        .route("/observations/:indicator/:area", get(observations_handler))
        .route("/observations/:indicator/:area/:year", get(observations_handler))
        .route("/statistics", get(statistics_handler))
        .route("/statistics/:indicator", get(statistics_handler))
        .route("/statistics/:indicator/:area", get(statistics_handler))
        .route("/statistics/:indicator/:area/:year", get(statistics_handler))
        .route("/visualisations", get(visualisations_handler))
        .route("/visualisations/:indicator", get(visualisations_handler))
        .route("/visualisations/:indicator/:area", get(visualisations_handler))
        .route("/visualisations/:indicator/:area/:year", get(visualisations_handler))
        .route("/visualisationsGroupedByArea", get(grouped_visualisations_handler))
        .route("/visualisationsGroupedByArea/:indicator", get(grouped_visualisations_handler))
        .route("/visualisationsGroupedByArea/:indicator/:area", get(grouped_visualisations_handler))
        .route(
            "/visualisationsGroupedByArea/:indicator/:area/:year",
            get(grouped_visualisations_handler),
        )
        .route("/years", get(years_handler))
        .route("/yearsWithIndicatorData", get(years_with_data_handler))
        .route("/indexObservations/:year", get(index_observations_handler))
        .route("/indexStats/:year", get(index_stats_handler))
        .route("/indexEvolution/:year", get(index_evolution_handler))
        .route("/countryObservations/:area", get(country_observations_handler))
        .layer(middleware::from_fn_with_state(cache, cache::cache_responses))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let ttl: u64 = match std::env::var("CACHE_TTL_SECS") {
        Ok(raw) => raw.parse().context("CACHE_TTL_SECS must be a number of seconds")?,
        Err(_) => 30,
    };

    info!("Connecting to database...");
    let pool = db::connect(&db_url, 10)
        .await
        .context("Failed to connect to database")?;
    info!("Database connected");

    let state = Arc::new(AppState {
        pool,
        started_at: Utc::now(),
    });

    if let Some(out_dir) = args.export {
        let written = export::export_all(&state, &out_dir).await?;
        info!("Wrote {} documents to {}", written, out_dir.display());
        return Ok(());
    }

    let app = router(state, ResponseCache::new(Duration::from_secs(ttl)));

    info!("API listening on http://{} (cache ttl {}s)", bind, ttl);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
