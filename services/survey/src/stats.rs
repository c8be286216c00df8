//! Summary statistics over observation values, globally and per region.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::area::AreaIndex;
use crate::observation::Observation;

/// Key under which the statistics over every area are stored.
pub const GLOBAL: &str = ":::";

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Statistics {
    /// Absent and NaN values are ignored; an empty set has no mean or median.
    pub fn from_values(values: impl IntoIterator<Item = Option<f64>>) -> Self {
        let mut values: Vec<f64> = values
            .into_iter()
            .flatten()
            .filter(|v| !v.is_nan())
            .collect();
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        Self {
            count,
            mean: Some(values.iter().sum::<f64>() / count as f64),
            median: Some(median),
            min: values.first().copied(),
            max: values.last().copied(),
        }
    }
}

/// indicator code -> (`:::` or region iso3) -> statistics.
pub type StatisticsTable = BTreeMap<String, BTreeMap<String, Statistics>>;

/// Statistics of `value` per indicator over all areas and over the countries
/// of each region. Dataset observations are left out.
pub fn compute_statistics(observations: &[Observation], areas: &AreaIndex) -> StatisticsTable {
    let mut by_indicator: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for o in observations.iter().filter(|o| !o.is_dataset()) {
        by_indicator.entry(o.indicator_code.as_str()).or_default().push(o);
    }

    let mut table = StatisticsTable::new();
    for (code, obs) in by_indicator {
        let mut per_area = BTreeMap::new();
        per_area.insert(
            GLOBAL.to_string(),
            Statistics::from_values(obs.iter().map(|o| o.value)),
        );
        for region in areas.regions() {
            let members: Vec<&str> = areas.countries_in(&region.iso3).map(|a| a.iso3.as_str()).collect();
            let stats = Statistics::from_values(
                obs.iter()
                    .filter(|o| members.contains(&o.area_code.as_str()))
                    .map(|o| o.value),
            );
            per_area.insert(region.iso3.clone(), stats);
        }
        table.insert(code.to_string(), per_area);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::tests::sample_areas;

    #[test]
    fn test_from_values_odd_and_even() {
        let odd = Statistics::from_values([Some(3.0), Some(1.0), Some(2.0)]);
        assert_eq!(odd.count, 3);
        assert_eq!(odd.mean, Some(2.0));
        assert_eq!(odd.median, Some(2.0));
        assert_eq!(odd.min, Some(1.0));
        assert_eq!(odd.max, Some(3.0));

        let even = Statistics::from_values([Some(4.0), None, Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(even.count, 4);
        assert_eq!(even.median, Some(2.5));
    }

    #[test]
    fn test_empty_set_has_no_mean() {
        let empty = Statistics::from_values([None, None]);
        assert_eq!(empty, Statistics::default());
        assert_eq!(empty.mean, None);
    }

    #[test]
    fn test_global_and_regional_statistics() {
        let areas = sample_areas();
        let obs = vec![
            Observation::new("GOV_POL", "FRA", 2015, Some(0.9)),
            Observation::new("GOV_POL", "ESP", 2015, Some(0.5)),
            Observation::new("GOV_POL", "KEN", 2015, Some(0.1)),
        ];
        let table = compute_statistics(&obs, &areas);
        let gov = &table["GOV_POL"];
        assert_eq!(gov[GLOBAL].count, 3);
        assert_eq!(gov[GLOBAL].median, Some(0.5));
        assert_eq!(gov[":EU"].count, 2);
        assert_eq!(gov[":EU"].max, Some(0.9));
        assert_eq!(gov[":AF"].mean, Some(0.1));
    }

    #[test]
    fn test_region_without_data_is_empty_not_missing() {
        let areas = sample_areas();
        let obs = vec![Observation::new("ODB", "FRA", 2015, Some(50.0))];
        let table = compute_statistics(&obs, &areas);
        assert_eq!(table["ODB"][":AF"], Statistics::default());
    }
}
