//! Response payloads assembled from observations and statistics.

use std::collections::BTreeMap;

use serde::Serialize;
use survey::db::areas::AreaInfo;
use survey::stats::{compute_statistics, Statistics, StatisticsTable};
use survey::{Area, AreaIndex, Observation};

#[derive(Debug, PartialEq, Serialize)]
pub struct YearEntry {
    pub year: i32,
    pub indicators: Vec<String>,
}

/// Groups (year, indicator) pairs by year, both ascending.
pub fn indicators_by_year(pairs: Vec<(i32, String)>) -> BTreeMap<i32, Vec<String>> {
    let mut by_year: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for (year, code) in pairs {
        by_year.entry(year).or_default().push(code);
    }
    for indicators in by_year.values_mut() {
        indicators.sort();
        indicators.dedup();
    }
    by_year
}

pub fn years_listing(pairs: Vec<(i32, String)>) -> Vec<YearEntry> {
    indicators_by_year(pairs)
        .into_iter()
        .map(|(year, indicators)| YearEntry { year, indicators })
        .collect()
}

/// Turns indicator -> area into area -> indicator.
pub fn statistics_by_area(table: StatisticsTable) -> BTreeMap<String, BTreeMap<String, Statistics>> {
    let mut by_area: BTreeMap<String, BTreeMap<String, Statistics>> = BTreeMap::new();
    for (indicator, per_area) in table {
        for (area, stats) in per_area {
            by_area.entry(area).or_default().insert(indicator.clone(), stats);
        }
    }
    by_area
}

#[derive(Debug, Serialize)]
pub struct IndexObservations {
    pub year: i32,
    pub observations: Vec<Observation>,
    pub statistics: StatisticsTable,
}

#[derive(Debug, Default, Serialize)]
pub struct CountryYear {
    pub observations: Vec<Observation>,
    pub datasets: Vec<Observation>,
    pub statistics: StatisticsTable,
}

#[derive(Debug, Serialize)]
pub struct CountryObservations {
    pub area: Area,
    pub years: BTreeMap<i32, CountryYear>,
}

/// Splits a country's observations per year into ranked and dataset ones,
/// with statistics over `peers` for the indicators the country has that year.
pub fn country_years(
    country: Vec<Observation>,
    peers: &[Observation],
    areas: &AreaIndex,
) -> BTreeMap<i32, CountryYear> {
    let mut years: BTreeMap<i32, CountryYear> = BTreeMap::new();
    for observation in country {
        let entry = years.entry(observation.year).or_default();
        if observation.is_dataset() {
            entry.datasets.push(observation);
        } else {
            entry.observations.push(observation);
        }
    }
    for (year, entry) in years.iter_mut() {
        let codes: Vec<&str> = entry
            .observations
            .iter()
            .map(|o| o.indicator_code.as_str())
            .collect();
        let same_year: Vec<Observation> = peers
            .iter()
            .filter(|o| o.year == *year && codes.contains(&o.indicator_code.as_str()))
            .cloned()
            .collect();
        entry.statistics = compute_statistics(&same_year, areas);
    }
    years
}

// =============================================================================
// Visualisations
// =============================================================================

/// Observations of a query with statistics over them and over the same
/// indicators and years for every area.
#[derive(Debug, Serialize)]
pub struct Visualisation {
    pub observations: Vec<Observation>,
    pub statistics: StatisticsTable,
    pub statistics_all_areas: StatisticsTable,
}

pub fn visualisation(observations: Vec<Observation>, all_areas: &[Observation], areas: &AreaIndex) -> Visualisation {
    Visualisation {
        statistics: compute_statistics(&observations, areas),
        statistics_all_areas: compute_statistics(all_areas, areas),
        observations,
    }
}

/// Like [`Visualisation`], with observations keyed by country. Every
/// requested country has an entry, possibly empty.
#[derive(Debug, Serialize)]
pub struct GroupedVisualisation {
    pub areas: BTreeMap<String, Vec<Observation>>,
    pub statistics: StatisticsTable,
    pub statistics_all_areas: StatisticsTable,
}

pub fn grouped_visualisation(
    country_codes: &[String],
    observations: Vec<Observation>,
    all_areas: &[Observation],
    areas: &AreaIndex,
) -> GroupedVisualisation {
    let statistics = compute_statistics(&observations, areas);
    let mut grouped: BTreeMap<String, Vec<Observation>> =
        country_codes.iter().map(|c| (c.clone(), Vec::new())).collect();
    for observation in observations {
        if let Some(entry) = grouped.get_mut(&observation.area_code) {
            entry.push(observation);
        }
    }
    GroupedVisualisation {
        areas: grouped,
        statistics,
        statistics_all_areas: compute_statistics(all_areas, areas),
    }
}

// =============================================================================
// Index evolution
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankPoint {
    pub year: i32,
    pub rank: Option<i32>,
}

/// One indicator of one country: the value in the requested year, plus the
/// rank history when the indicator is the INDEX.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct EvolutionEntry {
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_change: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rank_evolution: Vec<RankPoint>,
}

#[derive(Debug, Serialize)]
pub struct IndexEvolution {
    pub year: i32,
    pub areas: BTreeMap<String, BTreeMap<String, EvolutionEntry>>,
    pub statistics: StatisticsTable,
}

/// Builds the per-country view of `year` from observations of every year.
/// Countries without an INDEX value in `year` are left out; statistics cover
/// `year` only.
pub fn index_evolution(year: i32, index_code: &str, observations: Vec<Observation>, areas: &AreaIndex) -> IndexEvolution {
    let mut by_area: BTreeMap<String, BTreeMap<String, EvolutionEntry>> = BTreeMap::new();
    let mut this_year = Vec::new();
    for observation in observations.into_iter().filter(|o| !o.is_dataset()) {
        let entry = by_area
            .entry(observation.area_code.clone())
            .or_default()
            .entry(observation.indicator_code.clone())
            .or_default();
        let is_index = observation.indicator_code == index_code;
        if is_index {
            entry.rank_evolution.push(RankPoint {
                year: observation.year,
                rank: observation.rank,
            });
        }
        if observation.year == year {
            entry.value = observation.value;
            if is_index {
                entry.rank = observation.rank;
                entry.rank_change = observation.rank_change;
            }
            this_year.push(observation);
        }
    }
    by_area.retain(|_, indicators| indicators.get(index_code).is_some_and(|e| e.value.is_some()));
    for indicators in by_area.values_mut() {
        for entry in indicators.values_mut() {
            entry.rank_evolution.sort_by_key(|p| p.year);
        }
    }
    IndexEvolution {
        year,
        areas: by_area,
        statistics: compute_statistics(&this_year, areas),
    }
}

// =============================================================================
// Area info
// =============================================================================

#[derive(Debug, PartialEq, Serialize)]
pub struct AreaValue {
    pub area: String,
    pub value: Option<f64>,
    pub year: Option<i32>,
}

/// One enrichment indicator with its value for every country that has one.
#[derive(Debug, PartialEq, Serialize)]
pub struct IndicatorInfo {
    pub indicator_code: String,
    pub provider_name: Option<String>,
    pub provider_url: Option<String>,
    pub values: Vec<AreaValue>,
}

pub fn areas_info(rows: Vec<AreaInfo>) -> Vec<IndicatorInfo> {
    let mut by_indicator: BTreeMap<String, IndicatorInfo> = BTreeMap::new();
    for row in rows {
        let info = by_indicator
            .entry(row.indicator_code.clone())
            .or_insert_with(|| IndicatorInfo {
                indicator_code: row.indicator_code.clone(),
                provider_name: None,
                provider_url: None,
                values: Vec::new(),
            });
        if row.provider_name.is_some() {
            info.provider_name = row.provider_name;
            info.provider_url = row.provider_url;
        }
        info.values.push(AreaValue {
            area: row.area_code,
            value: row.value,
            year: row.year,
        });
    }
    by_indicator.into_values().collect()
}
