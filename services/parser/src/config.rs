//! Parser layout configuration, loaded from a JSON file.
//!
//! Column references may be written as 0-based integers or as spreadsheet
//! letters (`"A"`, `"AF"`); both become a [`ColumnRef`] at load time so the
//! resolver only ever sees column indices.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use survey::RankingPolicy;

use crate::classifier::{has_literal_text, Classifier, PatternFamily};

// =============================================================================
// Column and sheet references
// =============================================================================

/// A 0-based column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawColumnRef")]
pub struct ColumnRef(pub usize);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawColumnRef {
    Index(usize),
    Letters(String),
}

impl TryFrom<RawColumnRef> for ColumnRef {
    type Error = String;

    fn try_from(raw: RawColumnRef) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawColumnRef::Index(i) => Ok(ColumnRef(i)),
            RawColumnRef::Letters(s) => ColumnRef::parse(&s),
        }
    }
}

impl ColumnRef {
    /// `"A"` is 0, `"Z"` 25, `"AA"` 26, `"AF"` 31. Digit strings are indices.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<usize>() {
            return Ok(ColumnRef(i));
        }
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid column reference '{}'", raw));
        }
        let number = raw
            .to_ascii_uppercase()
            .bytes()
            .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize))
            .ok_or_else(|| format!("column reference '{}' is out of range", raw))?;
        Ok(ColumnRef(number - 1))
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut n = self.0 + 1;
        let mut letters = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        letters.iter().rev().try_for_each(|c| write!(f, "{}", c))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for SheetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetRef::Index(i) => write!(f, "#{}", i),
            SheetRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    pub structure_access: StructureAccess,
    pub area_access: AreaAccess,
    pub raw_observations: RawObservations,
    pub structure_observations: StructureObservations,
    #[serde(default)]
    pub dataset_observations: Option<DatasetObservations>,
    #[serde(default = "default_regions")]
    pub regions: BTreeMap<String, RegionCode>,
    #[serde(default)]
    pub ranking: RankingPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureAccess {
    pub file: PathBuf,
    pub structure: StructureSheet,
    pub indicators: IndicatorSheet,
}

/// INDEX, SUBINDEX and COMPONENT rows.
#[derive(Debug, Clone, Deserialize)]
pub struct StructureSheet {
    pub sheet: SheetRef,
    pub start_row: usize,
    pub code_column: ColumnRef,
    pub name_column: ColumnRef,
    pub type_column: ColumnRef,
    pub weight_column: Option<ColumnRef>,
    pub short_name_column: Option<ColumnRef>,
}

/// PRIMARY and SECONDARY rows with their metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorSheet {
    pub sheet: SheetRef,
    pub start_row: usize,
    pub code_column: ColumnRef,
    pub name_column: ColumnRef,
    pub type_column: ColumnRef,
    pub subindex_column: ColumnRef,
    pub component_column: ColumnRef,
    pub short_name_column: Option<ColumnRef>,
    pub description_column: Option<ColumnRef>,
    pub units_column: Option<ColumnRef>,
    pub provider_name_column: Option<ColumnRef>,
    pub provider_url_column: Option<ColumnRef>,
    pub source_name_column: Option<ColumnRef>,
    pub source_url_column: Option<ColumnRef>,
    pub source_data_column: Option<ColumnRef>,
    pub license_column: Option<ColumnRef>,
    pub range_column: Option<ColumnRef>,
    pub format_notes_column: Option<ColumnRef>,
    pub tags_column: Option<ColumnRef>,
    pub weight_column: Option<ColumnRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaAccess {
    pub file: PathBuf,
    pub sheet: SheetRef,
    pub start_row: usize,
    pub iso2_column: ColumnRef,
    pub iso3_column: ColumnRef,
    pub name_column: ColumnRef,
    pub region_column: ColumnRef,
    pub income_column: Option<ColumnRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegionCode {
    pub iso2: String,
    pub iso3: String,
}

/// Row/column layout shared by every observation sheet family.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetLayout {
    /// Matched against sheet names at their start.
    pub sheet_pattern: String,
    /// First capture group (or whole match) is the sheet's year.
    #[serde(default = "default_year_pattern")]
    pub year_pattern: String,
    #[serde(default)]
    pub header_row: usize,
    pub start_row: usize,
    #[serde(default)]
    pub start_column: ColumnRef,
    pub iso3_column: ColumnRef,
    /// Per-row year, overriding the sheet's year when present.
    pub year_column: Option<ColumnRef>,
    /// Rows whose check cell is empty carry no data.
    pub check_column: Option<ColumnRef>,
}

impl SheetLayout {
    pub fn sheet_regex(&self) -> Result<Regex> {
        Regex::new(&self.sheet_pattern)
            .with_context(|| format!("Invalid sheet pattern '{}'", self.sheet_pattern))
    }

    pub fn year_regex(&self) -> Result<Regex> {
        Regex::new(&self.year_pattern)
            .with_context(|| format!("Invalid year pattern '{}'", self.year_pattern))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawObservations {
    pub file: PathBuf,
    pub layout: SheetLayout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureObservations {
    pub file: PathBuf,
    pub layout: SheetLayout,
    /// Header templates keyed by year, plus a `default` entry.
    pub patterns: BTreeMap<String, HeaderPatterns>,
}

pub const DEFAULT_PATTERNS: &str = "default";

/// Header templates. `{code}` captures the indicator short name, `{subindex}`
/// the owning subindex short name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeaderPatterns {
    pub index_scaled: String,
    pub subindex_scaled: String,
    pub subindex_rank: String,
    pub subindex_value: String,
    pub component_scaled: String,
    pub component_value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetObservations {
    pub file: PathBuf,
    pub layout: SheetLayout,
    pub indicator_column: ColumnRef,
    pub dataset_indicator_column: ColumnRef,
    pub value_column: ColumnRef,
}

fn default_year_pattern() -> String {
    r"(\d{4})".to_string()
}

fn default_regions() -> BTreeMap<String, RegionCode> {
    [
        ("East Asia & Pacific", ":P", ":PA"),
        ("Europe & Central Asia", ":E", ":EU"),
        ("Latin America & Caribbean", ":L", ":LA"),
        ("Middle East & North Africa", ":M", ":ME"),
        ("North America", ":N", ":NA"),
        ("South Asia", ":S", ":SA"),
        ("Sub-Saharan Africa", ":A", ":AF"),
    ]
    .into_iter()
    .map(|(name, iso2, iso3)| {
        (
            name.to_string(),
            RegionCode {
                iso2: iso2.to_string(),
                iso3: iso3.to_string(),
            },
        )
    })
    .collect()
}

impl ParserConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Parses and validates: every regex and header template must compile,
    /// and no template may consist of placeholders alone.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: ParserConfig = serde_json::from_str(content)?;
        config.raw_observations.layout.sheet_regex()?;
        config.raw_observations.layout.year_regex()?;
        config.structure_observations.layout.sheet_regex()?;
        config.structure_observations.layout.year_regex()?;
        if !config.structure_observations.patterns.contains_key(DEFAULT_PATTERNS) {
            anyhow::bail!("structure_observations.patterns has no '{}' entry", DEFAULT_PATTERNS);
        }
        for (year, patterns) in &config.structure_observations.patterns {
            for family in PatternFamily::PRECEDENCE {
                let template = family.template(patterns);
                if !has_literal_text(template) {
                    anyhow::bail!(
                        "Header template '{}' ({:?}, '{}') has no text besides placeholders",
                        template,
                        family,
                        year
                    );
                }
            }
            Classifier::compile(patterns)
                .with_context(|| format!("Invalid header patterns for '{}'", year))?;
        }
        if let Some(dataset) = &config.dataset_observations {
            dataset.layout.sheet_regex()?;
            dataset.layout.year_regex()?;
        }
        Ok(config)
    }
}

/// Configured name and ISO codes for a region name, compared
/// case-insensitively.
pub fn region_code<'r>(regions: &'r BTreeMap<String, RegionCode>, name: &str) -> Option<(&'r str, &'r RegionCode)> {
    let name = name.trim();
    regions
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(n, code)| (n.as_str(), code))
}
