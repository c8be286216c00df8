//! Observation query surface: indicator, area, year and tree-level filters.
//!
//! Filters arrive as strings from the API path (`ALL`, comma lists, year
//! ranges, `LATEST`) and are resolved once against the in-memory indicator
//! tree and area index into an [`ObservationFilter`] that both the SQL
//! repository and in-memory stores apply.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::area::AreaIndex;
use crate::error::{Result, SurveyError};
use crate::hierarchy::IndicatorTree;
use crate::indicator::IndicatorType;
use crate::observation::Observation;

pub const ALL: &str = "ALL";

fn is_all(raw: &str) -> bool {
    raw.trim().is_empty() || raw.trim().eq_ignore_ascii_case(ALL)
}

// =============================================================================
// Years
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YearFilter {
    Latest,
    /// Inclusive `(from, to)` spans, sorted and merged. A single year is a
    /// span of one. Spans are never expanded; they are matched against the
    /// years actually stored.
    Spans(Vec<(i32, i32)>),
}

impl YearFilter {
    /// Parses `2015`, `2013,2015`, `2013-2015`, a mix of those, or `LATEST`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("LATEST") {
            return Ok(Self::Latest);
        }
        let invalid = || SurveyError::InvalidYearFilter(raw.to_string());
        let mut spans = Vec::new();
        for part in trimmed.split(',').map(str::trim) {
            if part.is_empty() {
                return Err(invalid());
            }
            let span = match part.split_once('-') {
                Some((from, to)) => {
                    let from: i32 = from.trim().parse().map_err(|_| invalid())?;
                    let to: i32 = to.trim().parse().map_err(|_| invalid())?;
                    if from > to {
                        return Err(invalid());
                    }
                    (from, to)
                }
                None => {
                    let year = part.parse::<i32>().map_err(|_| invalid())?;
                    (year, year)
                }
            };
            spans.push(span);
        }
        spans.sort_unstable();
        let mut merged: Vec<(i32, i32)> = Vec::with_capacity(spans.len());
        for (from, to) in spans {
            match merged.last_mut() {
                Some(last) if from <= last.1.saturating_add(1) => last.1 = last.1.max(to),
                _ => merged.push((from, to)),
            }
        }
        Ok(Self::Spans(merged))
    }

    pub fn contains(&self, year: i32) -> bool {
        match self {
            Self::Latest => false,
            Self::Spans(spans) => spans.iter().any(|(from, to)| (*from..=*to).contains(&year)),
        }
    }

    /// Concrete years, sorted, among the years present in the store.
    pub fn resolve(&self, available: &[i32]) -> Vec<i32> {
        let mut years: Vec<i32> = match self {
            Self::Latest => available.iter().max().copied().into_iter().collect(),
            Self::Spans(_) => available.iter().copied().filter(|y| self.contains(*y)).collect(),
        };
        years.sort_unstable();
        years.dedup();
        years
    }
}

impl FromStr for YearFilter {
    type Err = SurveyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Tree levels
// =============================================================================

/// How deep below a requested indicator a query reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TreeLevel {
    Index,
    Subindex,
    Component,
    Indicator,
}

impl TreeLevel {
    pub fn depth(self) -> u8 {
        match self {
            Self::Index => IndicatorType::Index.depth(),
            Self::Subindex => IndicatorType::Subindex.depth(),
            Self::Component => IndicatorType::Component.depth(),
            Self::Indicator => IndicatorType::Primary.depth(),
        }
    }
}

impl fmt::Display for TreeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Index => "INDEX",
            Self::Subindex => "SUBINDEX",
            Self::Component => "COMPONENT",
            Self::Indicator => "INDICATOR",
        };
        f.write_str(name)
    }
}

impl FromStr for TreeLevel {
    type Err = SurveyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "INDEX" => Ok(Self::Index),
            "SUBINDEX" | "SUB-INDEX" => Ok(Self::Subindex),
            "COMPONENT" => Ok(Self::Component),
            "INDICATOR" | "PRIMARY" | "SECONDARY" => Ok(Self::Indicator),
            other => Err(SurveyError::InvalidTreeLevel(other.to_string())),
        }
    }
}

/// The indicator plus every descendant no deeper than `level`.
pub fn find_tree_codes(tree: &IndicatorTree, code: &str, level: TreeLevel) -> Result<Vec<String>> {
    Ok(tree
        .descendants_to_depth(code, level.depth())?
        .into_iter()
        .map(|i| i.code.clone())
        .collect())
}

// =============================================================================
// Filters
// =============================================================================

/// Raw query parameters as they come from a request.
#[derive(Debug, Clone, Default)]
pub struct ObservationQuery {
    pub indicator: String,
    pub area: String,
    pub year: String,
    pub level: Option<TreeLevel>,
    pub include_dataset: bool,
}

impl ObservationQuery {
    pub fn new(indicator: &str, area: &str, year: &str) -> Self {
        Self {
            indicator: indicator.to_string(),
            area: area.to_string(),
            year: year.to_string(),
            level: None,
            include_dataset: false,
        }
    }

    pub fn with_level(mut self, level: Option<TreeLevel>) -> Self {
        self.level = level;
        self
    }

    pub fn with_datasets(mut self) -> Self {
        self.include_dataset = true;
        self
    }

    /// Validates every part of the query and expands it into concrete codes.
    pub fn resolve(
        &self,
        tree: &IndicatorTree,
        areas: &AreaIndex,
        available_years: &[i32],
    ) -> Result<ObservationFilter> {
        let indicator_codes = resolve_indicators(tree, &self.indicator, self.level)?;
        let area_codes = if is_all(&self.area) {
            None
        } else {
            Some(areas.resolve_filter(&self.area)?)
        };
        let years = if is_all(&self.year) {
            None
        } else {
            Some(YearFilter::parse(&self.year)?.resolve(available_years))
        };
        Ok(ObservationFilter {
            indicator_codes,
            area_codes,
            years,
            include_dataset: self.include_dataset,
        })
    }
}

fn resolve_indicators(
    tree: &IndicatorTree,
    raw: &str,
    level: Option<TreeLevel>,
) -> Result<Option<Vec<String>>> {
    if is_all(raw) {
        return match level {
            None => Ok(None),
            Some(level) => find_tree_codes(tree, &tree.index()?.code, level).map(Some),
        };
    }
    let mut codes: Vec<String> = Vec::new();
    for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let expanded = match level {
            Some(level) => find_tree_codes(tree, code, level)?,
            None => vec![tree.find_by_code(code, None)?.code.clone()],
        };
        for code in expanded {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    Ok(Some(codes))
}

/// A resolved query. `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationFilter {
    pub indicator_codes: Option<Vec<String>>,
    pub area_codes: Option<Vec<String>>,
    pub years: Option<Vec<i32>>,
    pub include_dataset: bool,
}

impl ObservationFilter {
    pub fn matches(&self, observation: &Observation) -> bool {
        if observation.is_dataset() && !self.include_dataset {
            return false;
        }
        let indicator_ok = self
            .indicator_codes
            .as_ref()
            .map_or(true, |codes| codes.contains(&observation.indicator_code));
        let area_ok = self
            .area_codes
            .as_ref()
            .map_or(true, |codes| codes.contains(&observation.area_code));
        let year_ok = self
            .years
            .as_ref()
            .map_or(true, |years| years.contains(&observation.year));
        indicator_ok && area_ok && year_ok
    }
}

/// Orders by rank (unranked last), then area, then indicator and year.
pub fn compare_by_rank(a: &Observation, b: &Observation) -> Ordering {
    let rank = match (a.rank, b.rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    rank.then_with(|| a.area_code.cmp(&b.area_code))
        .then_with(|| a.indicator_code.cmp(&b.indicator_code))
        .then_with(|| a.year.cmp(&b.year))
        .then_with(|| a.dataset_indicator_code.cmp(&b.dataset_indicator_code))
}

pub fn sort_by_rank(observations: &mut [Observation]) {
    observations.sort_by(compare_by_rank);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::tests::sample_areas;
    use crate::hierarchy::tests::sample_tree;

    #[test]
    fn test_year_filter_parse() {
        assert_eq!(YearFilter::parse("2015").unwrap(), YearFilter::Spans(vec![(2015, 2015)]));
        assert_eq!(
            YearFilter::parse("2015, 2013").unwrap(),
            YearFilter::Spans(vec![(2013, 2013), (2015, 2015)])
        );
        assert_eq!(
            YearFilter::parse("2013-2015").unwrap(),
            YearFilter::Spans(vec![(2013, 2015)])
        );
        assert_eq!(
            YearFilter::parse("2014,2013-2015,2016").unwrap(),
            YearFilter::Spans(vec![(2013, 2016)])
        );
        assert_eq!(YearFilter::parse("latest").unwrap(), YearFilter::Latest);
    }

    #[test]
    fn test_wide_year_range_stays_bounded() {
        let filter = YearFilter::parse("0-2147483647").unwrap();
        assert_eq!(filter, YearFilter::Spans(vec![(0, i32::MAX)]));
        assert_eq!(filter.resolve(&[2015, 2013, 2015]), vec![2013, 2015]);

        let filter = YearFilter::parse("2013-2020000").unwrap();
        assert!(filter.contains(2019999));
        assert_eq!(filter.resolve(&[2012, 2014]), vec![2014]);
        assert_eq!(
            YearFilter::parse("2147483647,2147483646").unwrap(),
            YearFilter::Spans(vec![(i32::MAX - 1, i32::MAX)])
        );
    }

    #[test]
    fn test_years_resolve_against_stored_years() {
        let filter = YearFilter::parse("2013,2016").unwrap();
        assert_eq!(filter.resolve(&[2013, 2014, 2015]), vec![2013]);
        assert!(filter.resolve(&[]).is_empty());
    }

    #[test]
    fn test_year_filter_rejects_garbage() {
        for raw in ["", "20x5", "2015-", "2016-2013", "2013,,2014"] {
            assert!(
                matches!(YearFilter::parse(raw), Err(SurveyError::InvalidYearFilter(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_latest_resolves_to_max_available_year() {
        assert_eq!(YearFilter::Latest.resolve(&[2013, 2016, 2014]), vec![2016]);
        assert!(YearFilter::Latest.resolve(&[]).is_empty());
    }

    #[test]
    fn test_tree_level_parse() {
        assert_eq!("component".parse::<TreeLevel>().unwrap(), TreeLevel::Component);
        assert!(matches!(
            "LEAF".parse::<TreeLevel>(),
            Err(SurveyError::InvalidTreeLevel(_))
        ));
    }

    #[test]
    fn test_find_tree_codes_respects_depth() {
        let tree = sample_tree();
        let subindices = find_tree_codes(&tree, "ODB", TreeLevel::Subindex).unwrap();
        assert_eq!(subindices.len(), 3);
        let readiness = find_tree_codes(&tree, "READINESS", TreeLevel::Indicator).unwrap();
        assert!(readiness.contains(&"GOV_POL".to_string()));
        assert!(!readiness.contains(&"IMPACT_POL".to_string()));
        assert!(find_tree_codes(&tree, "NOPE", TreeLevel::Index).is_err());
    }

    #[test]
    fn test_query_resolution() {
        let tree = sample_tree();
        let areas = sample_areas();
        let filter = ObservationQuery::new("GOV_POL,ENT_TRAIN", ":EU", "LATEST")
            .resolve(&tree, &areas, &[2014, 2015])
            .unwrap();
        assert_eq!(
            filter.indicator_codes,
            Some(vec!["GOV_POL".to_string(), "ENT_TRAIN".to_string()])
        );
        assert_eq!(
            filter.area_codes,
            Some(vec!["ESP".to_string(), "FRA".to_string(), "ITA".to_string()])
        );
        assert_eq!(filter.years, Some(vec![2015]));

        let all = ObservationQuery::new("ALL", "ALL", "ALL")
            .resolve(&tree, &areas, &[2015])
            .unwrap();
        assert_eq!(all, ObservationFilter::default());
    }

    #[test]
    fn test_query_resolution_errors() {
        let tree = sample_tree();
        let areas = sample_areas();
        let years = [2015];
        assert!(ObservationQuery::new("NOPE", "ALL", "ALL")
            .resolve(&tree, &areas, &years)
            .unwrap_err()
            .is_not_found());
        assert!(ObservationQuery::new("ALL", "Atlantis", "ALL")
            .resolve(&tree, &areas, &years)
            .unwrap_err()
            .is_not_found());
        assert!(ObservationQuery::new("ALL", "ALL", "soon")
            .resolve(&tree, &areas, &years)
            .unwrap_err()
            .is_bad_request());
    }

    #[test]
    fn test_filter_matches_and_sort() {
        let tree = sample_tree();
        let areas = sample_areas();
        let filter = ObservationQuery::new("ODB", "ALL", "2015")
            .with_level(Some(TreeLevel::Subindex))
            .resolve(&tree, &areas, &[2015])
            .unwrap();

        let mut a = Observation::new("READINESS", "FRA", 2015, Some(1.0));
        a.rank = Some(2);
        let mut b = Observation::new("READINESS", "ESP", 2015, Some(2.0));
        b.rank = Some(1);
        let c = Observation::new("READINESS", "ITA", 2015, None);
        let other_year = Observation::new("READINESS", "FRA", 2014, Some(1.0));
        let too_deep = Observation::new("GOV_POL", "FRA", 2015, Some(1.0));
        let mut nested = Observation::new("READINESS", "FRA", 2015, Some(1.0));
        nested.dataset_indicator_code = Some("DS".into());

        let mut matched: Vec<Observation> = [a, b, c, other_year, too_deep, nested]
            .into_iter()
            .filter(|o| filter.matches(o))
            .collect();
        sort_by_rank(&mut matched);
        let order: Vec<_> = matched.iter().map(|o| o.area_code.as_str()).collect();
        assert_eq!(order, vec!["ESP", "FRA", "ITA"]);
    }
}
