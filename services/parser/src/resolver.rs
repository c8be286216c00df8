//! Observation resolver.
//!
//! Turns the rows of raw, structure and dataset sheets into observations,
//! resolving indicator codes against the hierarchy and ISO3 codes against the
//! area index. Unknown indicators become orphan placeholders; unknown areas
//! and malformed rows are logged and skipped. A structural problem aborts the
//! sheet it was found in and nothing else.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use survey::ranking::rank_observations;
use survey::{
    AreaIndex, Indicator, IndicatorTree, IndicatorType, Observation, ObservationBatch, RankKey,
    RankingPolicy, SheetFamily,
};
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifierSet, ColumnRole};
use crate::config::{ColumnRef, DatasetObservations, SheetLayout};
use crate::error::{CompanionColumn, SheetError};
use crate::workbook::{Cell, Sheet};

// ============================================================================
// Bookkeeping
// ============================================================================

/// Lets a message through once per key.
#[derive(Debug, Default)]
pub struct WarningLimiter {
    seen: HashSet<String>,
}

impl WarningLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first(&mut self, key: &str) -> bool {
        self.seen.insert(key.to_string())
    }
}

/// Counters accumulated over a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveCounts {
    pub skipped_rows: usize,
    pub orphan_warnings: usize,
    pub duplicates: usize,
}

/// What resolving one sheet family produced.
#[derive(Debug)]
pub struct FamilyOutcome {
    pub family: SheetFamily,
    pub batch: ObservationBatch,
    pub sheets_resolved: usize,
    pub sheet_errors: Vec<SheetError>,
    pub duplicates: usize,
}

/// Area and year shared by every column of a data row.
#[derive(Debug, Clone)]
struct RowContext {
    area_code: String,
    year: i32,
}

/// Columns of one structure sheet that carry the same indicator.
#[derive(Debug)]
struct ColumnGroup {
    code: String,
    level: IndicatorType,
    scaled: Option<usize>,
    value: Option<usize>,
    rank: Option<usize>,
}

fn parse_year(cell: &Cell) -> Option<i32> {
    match cell {
        Cell::Number(n) if n.fract() == 0.0 => Some(*n as i32),
        Cell::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First capture group of the year pattern, else its whole match.
pub fn sheet_year(name: &str, pattern: &Regex) -> Option<i32> {
    let captures = pattern.captures(name)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .and_then(|m| m.as_str().parse().ok())
}

// ============================================================================
// Resolver
// ============================================================================

pub struct Resolver<'a> {
    tree: &'a IndicatorTree,
    areas: &'a AreaIndex,
    policy: RankingPolicy,
    orphans: BTreeMap<String, Indicator>,
    counts: ResolveCounts,
}

impl<'a> Resolver<'a> {
    pub fn new(tree: &'a IndicatorTree, areas: &'a AreaIndex, policy: RankingPolicy) -> Self {
        Self {
            tree,
            areas,
            policy,
            orphans: BTreeMap::new(),
            counts: ResolveCounts::default(),
        }
    }

    /// Placeholders created so far, in code order.
    pub fn orphans(&self) -> impl Iterator<Item = &Indicator> {
        self.orphans.values()
    }

    pub fn counts(&self) -> ResolveCounts {
        self.counts
    }

    fn orphan(&mut self, code: &str, sheet: &str, limiter: &mut WarningLimiter) -> String {
        let orphan = Indicator::orphan(code);
        let code = orphan.code.clone();
        if limiter.first(&code) {
            warn!("Sheet '{}': indicator {} is not in the hierarchy, stored as orphan", sheet, code);
            self.counts.orphan_warnings += 1;
        }
        self.orphans.entry(code.clone()).or_insert(orphan);
        code
    }

    fn resolve_indicator(
        &mut self,
        code: &str,
        kind: Option<IndicatorType>,
        sheet: &str,
        limiter: &mut WarningLimiter,
    ) -> String {
        match self.tree.find_by_code(code, kind) {
            Ok(indicator) => indicator.code.clone(),
            Err(_) => self.orphan(code, sheet, limiter),
        }
    }

    /// Area and year of each data row. Rows that carry no data are left out.
    fn row_contexts(
        &mut self,
        sheet: &Sheet,
        layout: &SheetLayout,
        year: Option<i32>,
    ) -> Vec<(usize, RowContext)> {
        let mut rows = Vec::new();
        for row in layout.start_row..sheet.row_count() {
            if let Some(check) = layout.check_column {
                if sheet.cell(row, check.index()).is_empty() {
                    continue;
                }
            }
            let Some(iso3) = sheet.text(row, layout.iso3_column.index()) else {
                continue;
            };
            let area_code = match self.areas.find_by_iso3(&iso3) {
                Ok(area) => area.iso3.clone(),
                Err(e) => {
                    warn!("Sheet '{}' row {}: {}, row skipped", sheet.name, row + 1, e);
                    self.counts.skipped_rows += 1;
                    continue;
                }
            };
            let row_year = match layout.year_column {
                Some(column) => match parse_year(sheet.cell(row, column.index())) {
                    Some(y) => Some(y),
                    None => {
                        warn!(
                            "Sheet '{}' row {}: malformed year {:?}, row skipped",
                            sheet.name,
                            row + 1,
                            sheet.cell(row, column.index())
                        );
                        self.counts.skipped_rows += 1;
                        continue;
                    }
                },
                None => year,
            };
            let Some(year) = row_year else {
                continue;
            };
            rows.push((row, RowContext { area_code, year }));
        }
        rows
    }

    fn year_of(sheet: &Sheet, layout: &SheetLayout, pattern: &Regex) -> Result<Option<i32>, SheetError> {
        let year = sheet_year(&sheet.name, pattern);
        if year.is_none() && layout.year_column.is_none() {
            return Err(SheetError::MissingYear {
                sheet: sheet.name.clone(),
            });
        }
        Ok(year)
    }

    /// Keeps the first observation per (area, year) and ranks each year.
    /// Observations come with the sheet row they were read from; `column` is
    /// the column reported for a dropped duplicate.
    fn rank_groups(
        &mut self,
        sheet: &str,
        column: usize,
        observations: Vec<(usize, Observation)>,
        key: Option<RankKey>,
    ) -> Vec<Observation> {
        let mut by_year: BTreeMap<i32, Vec<Observation>> = BTreeMap::new();
        for (row, observation) in observations {
            let year = by_year.entry(observation.year).or_default();
            if year.iter().any(|o| o.area_code == observation.area_code) {
                warn!("{}", duplicate_message(sheet, row, column, &observation));
                self.counts.duplicates += 1;
                continue;
            }
            year.push(observation);
        }
        let mut out = Vec::new();
        for (_, mut year) in by_year {
            if let Some(key) = key {
                rank_observations(&mut year, self.policy, key);
            }
            out.extend(year);
        }
        out
    }

    // ========================================================================
    // Raw sheets
    // ========================================================================

    /// One indicator per column, the code being the first token of the header
    /// cell. Ranked by value per year.
    pub fn resolve_raw_sheet(
        &mut self,
        sheet: &Sheet,
        layout: &SheetLayout,
        year_pattern: &Regex,
    ) -> Result<Vec<Observation>, SheetError> {
        let year = Self::year_of(sheet, layout, year_pattern)?;
        let rows = self.row_contexts(sheet, layout, year);
        let mut limiter = WarningLimiter::new();
        let mut out = Vec::new();

        for col in layout.start_column.index()..sheet.col_count() {
            let Some(header) = sheet.text(layout.header_row, col) else {
                continue;
            };
            let mut tokens = header.split_whitespace();
            let Some(code) = tokens.next() else {
                continue;
            };
            if tokens.next().is_some() {
                warn!("Sheet '{}': header '{}' stripped to {}", sheet.name, header, code);
            }
            let indicator_code = self.resolve_indicator(code, None, &sheet.name, &mut limiter);

            let column: Vec<(usize, Observation)> = rows
                .iter()
                .map(|(row, ctx)| {
                    let observation =
                        Observation::new(&indicator_code, &ctx.area_code, ctx.year, sheet.number(*row, col));
                    (*row, observation)
                })
                .collect();
            out.extend(self.rank_groups(&sheet.name, col, column, Some(RankKey::Value)));
        }
        Ok(out)
    }

    // ========================================================================
    // Structure sheets
    // ========================================================================

    fn structure_groups(
        &mut self,
        sheet: &Sheet,
        layout: &SheetLayout,
        classifiers: &ClassifierSet,
        year: Option<i32>,
        limiter: &mut WarningLimiter,
    ) -> Result<Vec<ColumnGroup>, SheetError> {
        let classifier = classifiers.for_year(year).ok_or_else(|| SheetError::MissingPatterns {
            sheet: sheet.name.clone(),
        })?;

        let mut groups: Vec<ColumnGroup> = Vec::new();
        for col in layout.start_column.index()..sheet.col_count() {
            let Some(header) = sheet.text(layout.header_row, col) else {
                continue;
            };
            let Some(matched) = classifier.classify_any(&header) else {
                debug!("Sheet '{}': column '{}' is not a data column", sheet.name, header);
                continue;
            };
            let level = matched.family.level();
            let code = match level {
                IndicatorType::Index => match self.tree.index() {
                    Ok(index) => index.code.clone(),
                    Err(_) => {
                        return Err(SheetError::MissingIndexIndicator {
                            sheet: sheet.name.clone(),
                        })
                    }
                },
                IndicatorType::Component => {
                    let short = matched.code.unwrap_or_default();
                    let subindex = matched.subindex.unwrap_or_default();
                    match self.tree.find_component(&subindex, &short) {
                        Ok(component) => component.code.clone(),
                        // short names repeat across subindices
                        Err(_) => self.orphan(&format!("{}_{}", subindex, short), &sheet.name, limiter),
                    }
                }
                _ => {
                    let short = matched.code.unwrap_or_default();
                    self.resolve_indicator(&short, Some(level), &sheet.name, limiter)
                }
            };

            let position = match groups.iter().position(|g| g.code == code) {
                Some(p) => p,
                None => {
                    groups.push(ColumnGroup {
                        code,
                        level,
                        scaled: None,
                        value: None,
                        rank: None,
                    });
                    groups.len() - 1
                }
            };
            let group = &mut groups[position];
            let slot = match matched.family.role() {
                ColumnRole::Scaled => &mut group.scaled,
                ColumnRole::Value => &mut group.value,
                ColumnRole::Rank => &mut group.rank,
            };
            if slot.is_some() {
                warn!(
                    "Sheet '{}': second {:?} column for {}, ignored",
                    sheet.name,
                    matched.family.role(),
                    group.code
                );
            } else {
                *slot = Some(col);
            }
        }

        if !groups.iter().any(|g| g.level == IndicatorType::Index) {
            return Err(SheetError::MissingIndexColumn {
                sheet: sheet.name.clone(),
            });
        }
        for group in &groups {
            for missing in companion_gaps(&sheet.name, group) {
                warn!("{}", missing);
            }
        }
        Ok(groups)
    }

    /// Scaled, value and rank columns grouped per indicator. Ranked by the
    /// scaled score when present, else by value; a group with only a rank
    /// column keeps the ranks found in the sheet.
    pub fn resolve_structure_sheet(
        &mut self,
        sheet: &Sheet,
        layout: &SheetLayout,
        year_pattern: &Regex,
        classifiers: &ClassifierSet,
    ) -> Result<Vec<Observation>, SheetError> {
        let year = Self::year_of(sheet, layout, year_pattern)?;
        let mut limiter = WarningLimiter::new();
        let groups = self.structure_groups(sheet, layout, classifiers, year, &mut limiter)?;
        let rows = self.row_contexts(sheet, layout, year);

        let mut out = Vec::new();
        for group in &groups {
            let observations: Vec<(usize, Observation)> = rows
                .iter()
                .map(|(row, ctx)| {
                    let scaled = group.scaled.and_then(|c| sheet.number(*row, c));
                    let value = match group.value {
                        Some(c) if group.level != IndicatorType::Index => sheet.number(*row, c),
                        _ => scaled,
                    };
                    let mut observation = Observation::new(&group.code, &ctx.area_code, ctx.year, value);
                    observation.scaled = scaled;
                    observation.rank = group
                        .rank
                        .and_then(|c| sheet.number(*row, c))
                        .map(|r| r.round() as i32);
                    (*row, observation)
                })
                .collect();
            let key = if group.scaled.is_some() {
                Some(RankKey::Scaled)
            } else if group.value.is_some() {
                Some(RankKey::Value)
            } else {
                None
            };
            let column = group.scaled.or(group.value).or(group.rank).unwrap_or_default();
            out.extend(self.rank_groups(&sheet.name, column, observations, key));
        }
        Ok(out)
    }

    // ========================================================================
    // Dataset sheets
    // ========================================================================

    /// One observation per row, keyed by the indicator and the dataset
    /// indicator it breaks down. Never ranked.
    pub fn resolve_dataset_sheet(
        &mut self,
        sheet: &Sheet,
        config: &DatasetObservations,
        year_pattern: &Regex,
    ) -> Result<Vec<Observation>, SheetError> {
        let layout = &config.layout;
        let year = Self::year_of(sheet, layout, year_pattern)?;
        let rows = self.row_contexts(sheet, layout, year);
        let mut limiter = WarningLimiter::new();

        let mut out = Vec::new();
        for (row, ctx) in rows {
            let Some(indicator) = sheet.text(row, config.indicator_column.index()) else {
                continue;
            };
            let Some(dataset) = sheet.text(row, config.dataset_indicator_column.index()) else {
                continue;
            };
            let indicator_code = self.resolve_indicator(&indicator, None, &sheet.name, &mut limiter);
            let dataset_code = self.resolve_indicator(&dataset, None, &sheet.name, &mut limiter);
            let mut observation = Observation::new(
                &indicator_code,
                &ctx.area_code,
                ctx.year,
                sheet.number(row, config.value_column.index()),
            );
            observation.dataset_indicator_code = Some(dataset_code);
            out.push(observation);
        }
        Ok(out)
    }

    // ========================================================================
    // Families
    // ========================================================================

    /// Resolves every sheet of a family into one batch. Sheet errors are
    /// collected, observations repeated across sheets keep their first
    /// occurrence.
    pub fn resolve_family<F>(&mut self, family: SheetFamily, sheets: &[&Sheet], mut resolve: F) -> FamilyOutcome
    where
        F: FnMut(&mut Self, &Sheet) -> Result<Vec<Observation>, SheetError>,
    {
        let mut outcome = FamilyOutcome {
            family,
            batch: ObservationBatch::new(),
            sheets_resolved: 0,
            sheet_errors: Vec::new(),
            duplicates: 0,
        };
        for &sheet in sheets {
            info!("Resolving {} sheet '{}'", family.as_str(), sheet.name);
            match resolve(self, sheet) {
                Ok(observations) => {
                    let found = observations.len();
                    for observation in observations {
                        if let Err(e) = outcome.batch.push(observation) {
                            warn!("Sheet '{}': {}, keeping the first", sheet.name, e);
                            outcome.duplicates += 1;
                        }
                    }
                    outcome.sheets_resolved += 1;
                    info!("  {} observations", found);
                }
                Err(e) => {
                    error!("{}", e);
                    outcome.sheet_errors.push(e);
                }
            }
        }
        self.counts.duplicates += outcome.duplicates;
        outcome
    }
}

/// Warning for a repeated (indicator, area, year) naming the sheet cell it
/// was read from, e.g. `C4`.
fn duplicate_message(sheet: &str, row: usize, column: usize, observation: &Observation) -> String {
    format!(
        "Sheet '{}' cell {}{}: duplicate observation {}/{}/{}, keeping the first",
        sheet,
        ColumnRef(column),
        row + 1,
        observation.indicator_code,
        observation.area_code,
        observation.year
    )
}

fn companion_gaps(sheet: &str, group: &ColumnGroup) -> Vec<CompanionColumn> {
    let mut gaps = Vec::new();
    if group.level == IndicatorType::Subindex && group.rank.is_none() {
        gaps.push(CompanionColumn::MissingRankColumn {
            sheet: sheet.to_string(),
            indicator: group.code.clone(),
        });
    }
    if matches!(group.level, IndicatorType::Subindex | IndicatorType::Component) && group.value.is_none() {
        gaps.push(CompanionColumn::MissingValueColumn {
            sheet: sheet.to_string(),
            indicator: group.code.clone(),
        });
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areas::tests::parsed_areas;
    use crate::classifier::tests::patterns;
    use crate::config::{ParserConfig, StructureObservations, DEFAULT_PATTERNS};
    use crate::indicators::tests::parsed_tree;
    use crate::workbook::tests::{num, text};
    use survey::{MemoryObservationStore, ObservationStore};

    fn layout(start_row: usize, start_column: usize) -> SheetLayout {
        SheetLayout {
            sheet_pattern: ".*".into(),
            year_pattern: r"(\d{4})".into(),
            header_row: 0,
            start_row,
            start_column: ColumnRef(start_column),
            iso3_column: ColumnRef(0),
            year_column: None,
            check_column: None,
        }
    }

    fn year_regex() -> Regex {
        Regex::new(r"(\d{4})").unwrap()
    }

    fn classifiers() -> ClassifierSet {
        let mut map = BTreeMap::new();
        map.insert(DEFAULT_PATTERNS.to_string(), patterns());
        ClassifierSet::from_config(&StructureObservations {
            file: "structure.xlsx".into(),
            layout: layout(1, 1),
            patterns: map,
        })
        .unwrap()
    }

    fn raw_sheet() -> Sheet {
        Sheet::from_rows(
            "Raw 2015",
            vec![
                vec![text("ISO3"), text("GOV_POL 2015"), text("ZZZ999")],
                vec![text("FRA"), num(0.9), num(1.0)],
                vec![text("ESP"), num(0.9), num(2.0)],
                vec![text("ITA"), num(0.4), num(3.0)],
            ],
        )
    }

    fn find<'o>(observations: &'o [Observation], indicator: &str, area: &str) -> &'o Observation {
        observations
            .iter()
            .find(|o| o.indicator_code == indicator && o.area_code == area)
            .unwrap_or_else(|| panic!("no observation for {indicator}/{area}"))
    }

    // ========================================================================
    // Raw sheets
    // ========================================================================

    #[test]
    fn test_raw_sheet_ranks_ties_by_competition() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&raw_sheet(), &layout(1, 1), &year_regex()).unwrap();

        assert_eq!(find(&obs, "GOV_POL", "FRA").rank, Some(1));
        assert_eq!(find(&obs, "GOV_POL", "ESP").rank, Some(1));
        assert_eq!(find(&obs, "GOV_POL", "ITA").rank, Some(3));
        assert_eq!(find(&obs, "GOV_POL", "ITA").year, 2015);
        assert_eq!(find(&obs, "GOV_POL", "ITA").value, Some(0.4));
    }

    #[test]
    fn test_unknown_code_warns_once_per_sheet() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&raw_sheet(), &layout(1, 1), &year_regex()).unwrap();

        let orphans: Vec<_> = resolver.orphans().map(|i| i.code.as_str()).collect();
        assert_eq!(orphans, vec!["ZZZ999"]);
        assert!(resolver.orphans().all(|i| i.is_orphan()));
        assert_eq!(resolver.counts().orphan_warnings, 1);
        assert_eq!(obs.iter().filter(|o| o.indicator_code == "ZZZ999").count(), 3);
    }

    #[test]
    fn test_unknown_area_skips_row() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Raw 2015",
            vec![
                vec![text("ISO3"), text("GOV_POL")],
                vec![text("FRA"), num(0.9)],
                vec![text("ATL"), num(0.8)],
                vec![Cell::Empty, num(0.7)],
            ],
        );
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&sheet, &layout(1, 1), &year_regex()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(resolver.counts().skipped_rows, 1);
    }

    #[test]
    fn test_duplicate_rows_keep_the_first() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Raw 2015",
            vec![
                vec![text("ISO3"), text("GOV_POL")],
                vec![text("FRA"), num(0.9)],
                vec![text("FRA"), num(0.1)],
            ],
        );
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&sheet, &layout(1, 1), &year_regex()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].value, Some(0.9));
        assert_eq!(resolver.counts().duplicates, 1);
    }

    #[test]
    fn test_duplicate_warning_names_the_cell() {
        let observation = Observation::new("GOV_POL", "FRA", 2015, Some(0.1));
        let message = duplicate_message("Raw 2015", 2, 1, &observation);
        assert!(message.contains("'Raw 2015' cell B3"), "{message}");
        assert!(message.contains("GOV_POL/FRA/2015"), "{message}");
        assert!(duplicate_message("S", 0, 27, &observation).contains("cell AB1"));
    }

    #[test]
    fn test_year_column_overrides_sheet_name() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Raw",
            vec![
                vec![text("ISO3"), text("Year"), text("GOV_POL")],
                vec![text("FRA"), num(2014.0), num(0.5)],
                vec![text("FRA"), text("2015"), num(0.6)],
                vec![text("ESP"), text("n/a"), num(0.7)],
            ],
        );
        let mut layout = layout(1, 2);
        layout.year_column = Some(ColumnRef(1));
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&sheet, &layout, &year_regex()).unwrap();

        let mut years: Vec<_> = obs.iter().map(|o| (o.year, o.rank)).collect();
        years.sort();
        assert_eq!(years, vec![(2014, Some(1)), (2015, Some(1))]);
        assert_eq!(resolver.counts().skipped_rows, 1);
    }

    #[test]
    fn test_sheet_without_year_is_rejected() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows("Raw", vec![vec![text("ISO3"), text("GOV_POL")]]);
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let err = resolver.resolve_raw_sheet(&sheet, &layout(1, 1), &year_regex()).unwrap_err();
        assert_eq!(err, SheetError::MissingYear { sheet: "Raw".into() });
    }

    #[test]
    fn test_check_column_skips_rows() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Raw 2016",
            vec![
                vec![text("ISO3"), text("In"), text("GOV_POL")],
                vec![text("FRA"), text("x"), num(0.9)],
                vec![text("ESP"), Cell::Empty, num(0.9)],
            ],
        );
        let mut layout = layout(1, 2);
        layout.check_column = Some(ColumnRef(1));
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_raw_sheet(&sheet, &layout, &year_regex()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].area_code, "FRA");
    }

    // ========================================================================
    // Structure sheets
    // ========================================================================

    fn structure_sheet() -> Sheet {
        Sheet::from_rows(
            "Structure 2015",
            vec![
                vec![
                    text("ISO3"),
                    text("ODB - Scaled"),
                    text("Readiness - Scaled"),
                    text("Readiness Rank"),
                    text("Readiness Score"),
                    text("Readiness: Policies - Scaled"),
                    text("Readiness: Policies Score"),
                    text("Notes"),
                    text("Impact Rank"),
                ],
                vec![
                    text("FRA"),
                    num(80.0),
                    num(70.0),
                    num(2.0),
                    num(7.0),
                    num(50.0),
                    num(5.0),
                    text("fine"),
                    num(1.0),
                ],
                vec![
                    text("ESP"),
                    num(90.0),
                    num(60.0),
                    num(1.0),
                    num(6.0),
                    num(55.0),
                    num(5.5),
                    Cell::Empty,
                    num(2.0),
                ],
            ],
        )
    }

    #[test]
    fn test_structure_sheet_groups_columns_per_indicator() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver
            .resolve_structure_sheet(&structure_sheet(), &layout(1, 1), &year_regex(), &classifiers())
            .unwrap();

        let odb = find(&obs, "ODB", "ESP");
        assert_eq!(odb.scaled, Some(90.0));
        assert_eq!(odb.value, Some(90.0));
        assert_eq!(odb.rank, Some(1));

        let readiness = find(&obs, "READINESS", "FRA");
        assert_eq!(readiness.scaled, Some(70.0));
        assert_eq!(readiness.value, Some(7.0));
        assert_eq!(readiness.rank, Some(1));

        let policies = find(&obs, "GOV_POLICIES", "ESP");
        assert_eq!(policies.value, Some(5.5));
        assert_eq!(policies.rank, Some(1));

        // rank-only group keeps the sheet's ranks
        assert_eq!(find(&obs, "IMPACT", "FRA").rank, Some(1));
        assert_eq!(find(&obs, "IMPACT", "ESP").value, None);
        assert_eq!(obs.len(), 8);
        assert_eq!(resolver.orphans().count(), 0);
    }

    #[test]
    fn test_non_data_columns_are_not_indicators() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let config = ParserConfig::from_json(crate::config::tests::SAMPLE).unwrap();
        let classifiers = ClassifierSet::from_config(&config.structure_observations).unwrap();
        let sheet = Sheet::from_rows(
            "Structure 2015",
            vec![
                vec![text("ISO3"), text("In"), text("ODB-Scaled"), text("Notes"), text("Country name")],
                vec![text("FRA"), text("x"), num(80.0), text("revised"), text("France")],
                vec![text("ESP"), text("x"), num(60.0), Cell::Empty, text("Spain")],
            ],
        );
        let mut layout = layout(1, 2);
        layout.check_column = Some(ColumnRef(1));
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver
            .resolve_structure_sheet(&sheet, &layout, &year_regex(), &classifiers)
            .unwrap();
        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.indicator_code == "ODB"));
        assert_eq!(find(&obs, "ODB", "FRA").rank, Some(1));
        assert_eq!(resolver.orphans().count(), 0);
        assert_eq!(resolver.counts().orphan_warnings, 0);
    }

    #[test]
    fn test_unknown_components_are_qualified_by_subindex() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Structure 2015",
            vec![
                vec![
                    text("ISO3"),
                    text("ODB - Scaled"),
                    text("Readiness: Mystery - Scaled"),
                    text("Impact: Mystery - Scaled"),
                ],
                vec![text("FRA"), num(80.0), num(10.0), num(20.0)],
            ],
        );
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver
            .resolve_structure_sheet(&sheet, &layout(1, 1), &year_regex(), &classifiers())
            .unwrap();
        let orphans: Vec<_> = resolver.orphans().map(|i| i.code.as_str()).collect();
        assert_eq!(orphans, vec!["IMPACT_MYSTERY", "READINESS_MYSTERY"]);
        assert_eq!(find(&obs, "READINESS_MYSTERY", "FRA").scaled, Some(10.0));
        assert_eq!(find(&obs, "IMPACT_MYSTERY", "FRA").scaled, Some(20.0));
    }

    #[test]
    fn test_companion_gaps() {
        let group = ColumnGroup {
            code: "IMPACT".into(),
            level: IndicatorType::Subindex,
            scaled: Some(1),
            value: None,
            rank: None,
        };
        assert_eq!(companion_gaps("S", &group).len(), 2);
        let component = ColumnGroup {
            level: IndicatorType::Component,
            value: Some(2),
            ..group
        };
        assert!(companion_gaps("S", &component).is_empty());
    }

    #[test]
    fn test_missing_index_column_aborts_sheet() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Structure 2015",
            vec![
                vec![text("ISO3"), text("Readiness - Scaled")],
                vec![text("FRA"), num(70.0)],
            ],
        );
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let err = resolver
            .resolve_structure_sheet(&sheet, &layout(1, 1), &year_regex(), &classifiers())
            .unwrap_err();
        assert_eq!(
            err,
            SheetError::MissingIndexColumn {
                sheet: "Structure 2015".into()
            }
        );
    }

    // ========================================================================
    // Dataset sheets and families
    // ========================================================================

    #[test]
    fn test_dataset_rows_resolve_both_codes() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let sheet = Sheet::from_rows(
            "Datasets 2015",
            vec![
                vec![text("ISO3"), text("Indicator"), text("Dataset"), text("Value")],
                vec![text("FRA"), text("GOV_POL"), text("WEF_GOV"), num(1.0)],
                vec![text("FRA"), text("GOV_POL"), text("DS_NEW"), num(0.0)],
            ],
        );
        let config = DatasetObservations {
            file: "datasets.xlsx".into(),
            layout: layout(1, 1),
            indicator_column: ColumnRef(1),
            dataset_indicator_column: ColumnRef(2),
            value_column: ColumnRef(3),
        };
        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let obs = resolver.resolve_dataset_sheet(&sheet, &config, &year_regex()).unwrap();
        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.is_dataset() && o.rank.is_none()));
        assert_eq!(obs[1].dataset_indicator_code.as_deref(), Some("DS_NEW"));
        assert_eq!(resolver.orphans().count(), 1);
    }

    #[tokio::test]
    async fn test_family_flush_is_idempotent() {
        let tree = parsed_tree();
        let areas = parsed_areas();
        let raw = raw_sheet();
        let broken = Sheet::from_rows("Raw", vec![vec![text("ISO3")]]);
        let layout = layout(1, 1);
        let year = year_regex();

        let mut resolver = Resolver::new(&tree, &areas, RankingPolicy::default());
        let outcome = resolver.resolve_family(SheetFamily::Raw, &[&raw, &raw, &broken], |r, s| {
            r.resolve_raw_sheet(s, &layout, &year)
        });
        assert_eq!(outcome.sheets_resolved, 2);
        assert_eq!(outcome.sheet_errors.len(), 1);
        assert_eq!(outcome.duplicates, 6);
        assert_eq!(outcome.batch.len(), 6);

        let mut store = MemoryObservationStore::new();
        let first = store
            .flush(SheetFamily::Raw, outcome.batch.as_slice().to_vec())
            .await
            .unwrap();
        assert_eq!(first.inserted, 6);
        let second = store
            .flush(SheetFamily::Raw, outcome.batch.into_vec())
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(store.count().await.unwrap(), 6);
    }
}
