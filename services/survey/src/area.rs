//! Countries and regions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyError};

/// A country or a region. Regions have no parent region; countries carry the
/// iso3 pseudo-code of the region they belong to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Area {
    pub iso3: String,
    pub iso2: String,
    pub name: String,
    pub region: Option<String>,
    pub income: Option<String>,
    pub search: Option<String>,
}

impl Area {
    pub fn country(iso3: &str, iso2: &str, name: &str, region: Option<&str>) -> Self {
        Self {
            iso3: iso3.trim().to_uppercase(),
            iso2: iso2.trim().to_uppercase(),
            name: name.trim().to_string(),
            region: region.map(|r| r.trim().to_uppercase()),
            ..Default::default()
        }
    }

    pub fn region(iso3: &str, iso2: &str, name: &str) -> Self {
        Self::country(iso3, iso2, name, None)
    }

    pub fn is_region(&self) -> bool {
        self.region.is_none()
    }
}

/// Lookup table over all areas, keyed by upper-case iso3.
#[derive(Debug, Clone, Default)]
pub struct AreaIndex {
    by_iso3: BTreeMap<String, Area>,
}

impl AreaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_iso3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_iso3.is_empty()
    }

    /// Inserts or replaces an area; returns the previous entry for that iso3.
    pub fn insert(&mut self, area: Area) -> Option<Area> {
        self.by_iso3.insert(area.iso3.to_uppercase(), area)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Area> {
        self.by_iso3.values()
    }

    pub fn find_by_iso3(&self, iso3: &str) -> Result<&Area> {
        self.by_iso3
            .get(&iso3.trim().to_uppercase())
            .ok_or_else(|| SurveyError::area_not_found(iso3.trim()))
    }

    /// Matches iso3, then iso2, then name (case-insensitive).
    pub fn find_by_code(&self, code: &str) -> Result<&Area> {
        let wanted = code.trim().to_uppercase();
        self.by_iso3
            .get(&wanted)
            .or_else(|| self.by_iso3.values().find(|a| a.iso2 == wanted))
            .or_else(|| self.by_iso3.values().find(|a| a.name.to_uppercase() == wanted))
            .ok_or_else(|| SurveyError::area_not_found(code.trim()))
    }

    pub fn countries(&self) -> impl Iterator<Item = &Area> {
        self.by_iso3.values().filter(|a| !a.is_region())
    }

    pub fn regions(&self) -> impl Iterator<Item = &Area> {
        self.by_iso3.values().filter(|a| a.is_region())
    }

    pub fn countries_in<'a>(&'a self, region_iso3: &'a str) -> impl Iterator<Item = &'a Area> {
        self.countries()
            .filter(move |a| a.region.as_deref() == Some(region_iso3))
    }

    /// Expands an area filter into country iso3 codes.
    ///
    /// `ALL` selects every country. Otherwise each comma-separated item must be
    /// a country (iso3, iso2 or name), a region (expands to its countries) or
    /// an income group.
    pub fn resolve_filter(&self, filter: &str) -> Result<Vec<String>> {
        if filter.trim().eq_ignore_ascii_case("ALL") {
            return Ok(self.countries().map(|a| a.iso3.clone()).collect());
        }
        let mut out: Vec<String> = Vec::new();
        for item in filter.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let matched: Vec<String> = match self.find_by_code(item) {
                Ok(area) if area.is_region() => {
                    self.countries_in(&area.iso3).map(|a| a.iso3.clone()).collect()
                }
                Ok(area) => vec![area.iso3.clone()],
                Err(_) => self
                    .countries()
                    .filter(|a| a.income.as_deref().is_some_and(|i| i.eq_ignore_ascii_case(item)))
                    .map(|a| a.iso3.clone())
                    .collect(),
            };
            if matched.is_empty() {
                return Err(SurveyError::area_not_found(item));
            }
            for iso3 in matched {
                if !out.contains(&iso3) {
                    out.push(iso3);
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<Area> for AreaIndex {
    fn from_iter<T: IntoIterator<Item = Area>>(iter: T) -> Self {
        let mut index = AreaIndex::new();
        for area in iter {
            index.insert(area);
        }
        index
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_areas() -> AreaIndex {
        let mut fra = Area::country("FRA", "FR", "France", Some(":EU"));
        fra.income = Some("HIC".into());
        let mut esp = Area::country("ESP", "ES", "Spain", Some(":EU"));
        esp.income = Some("HIC".into());
        let ita = Area::country("ITA", "IT", "Italy", Some(":EU"));
        let ken = Area::country("KEN", "KE", "Kenya", Some(":AF"));
        [
            Area::region(":EU", ":E", "Europe & Central Asia"),
            Area::region(":AF", ":A", "Sub-Saharan Africa"),
            fra,
            esp,
            ita,
            ken,
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_find_by_iso3() {
        let areas = sample_areas();
        assert_eq!(areas.find_by_iso3("fra").unwrap().name, "France");
        assert!(matches!(
            areas.find_by_iso3("XXX"),
            Err(SurveyError::AreaNotFound { ref code }) if code == "XXX"
        ));
    }

    #[test]
    fn test_countries_and_regions() {
        let areas = sample_areas();
        assert_eq!(areas.countries().count(), 4);
        assert_eq!(areas.regions().count(), 2);
        let eu: Vec<_> = areas.countries_in(":EU").map(|a| a.iso3.as_str()).collect();
        assert_eq!(eu, vec!["ESP", "FRA", "ITA"]);
    }

    #[test]
    fn test_resolve_filter() {
        let areas = sample_areas();
        assert_eq!(areas.resolve_filter("ALL").unwrap().len(), 4);
        assert_eq!(areas.resolve_filter("fr,Kenya").unwrap(), vec!["FRA", "KEN"]);
        assert_eq!(areas.resolve_filter(":AF").unwrap(), vec!["KEN"]);
        assert_eq!(areas.resolve_filter("hic").unwrap(), vec!["ESP", "FRA"]);
        assert!(areas.resolve_filter("Atlantis").is_err());
    }
}
