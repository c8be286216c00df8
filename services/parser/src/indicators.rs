//! Indicator parser: builds the hierarchy from the structure workbook.

use anyhow::{Context, Result};
use survey::{normalize_code, Indicator, IndicatorTree, IndicatorType, SurveyError};
use tracing::{info, warn};

use crate::config::{ColumnRef, IndicatorSheet, StructureAccess, StructureSheet};
use crate::workbook::{Cell, Sheet, Workbook};

/// Accepts plain numbers and fractions such as `1/3`.
pub fn parse_weight(cell: &Cell) -> Option<f64> {
    if let Cell::Number(n) = cell {
        return Some(*n);
    }
    let text = cell.text()?;
    let (numerator, denominator) = match text.split_once('/') {
        Some((n, d)) => (n.trim(), Some(d.trim())),
        None => (text.as_str(), None),
    };
    let is_decimal = |s: &str| {
        !s.is_empty()
            && s.chars().next().is_some_and(|c| c.is_ascii_digit())
            && s.chars().all(|c| c.is_ascii_digit() || c == '.')
            && s.matches('.').count() <= 1
    };
    if !is_decimal(numerator) || denominator.is_some_and(|d| !is_decimal(d)) {
        return None;
    }
    let numerator: f64 = numerator.parse().ok()?;
    match denominator {
        None => Some(numerator),
        Some(d) => {
            let d: f64 = d.parse().ok()?;
            (d != 0.0).then(|| numerator / d)
        }
    }
}

fn optional_text(sheet: &Sheet, row: usize, column: Option<ColumnRef>) -> Option<String> {
    column.and_then(|c| sheet.text(row, c.index()))
}

fn parse_type(raw: Option<String>, sheet: &Sheet, row: usize) -> Option<IndicatorType> {
    match raw.as_deref().map(str::parse::<IndicatorType>) {
        Some(Ok(kind)) => Some(kind),
        Some(Err(e)) => {
            warn!("Sheet '{}' row {}: {}, row skipped", sheet.name, row + 1, e);
            None
        }
        None => {
            warn!("Sheet '{}' row {}: no indicator type, row skipped", sheet.name, row + 1);
            None
        }
    }
}

/// INDEX, SUBINDEX and COMPONENT rows. Components belong to the nearest
/// SUBINDEX row above them; every non-INDEX row points at the INDEX.
pub fn parse_structure_sheet(sheet: &Sheet, layout: &StructureSheet) -> Vec<Indicator> {
    let mut rows = Vec::new();
    let mut current_subindex: Option<String> = None;
    for row in layout.start_row..sheet.row_count() {
        let Some(code) = sheet.text(row, layout.code_column.index()) else {
            continue;
        };
        let Some(kind) = parse_type(sheet.text(row, layout.type_column.index()), sheet, row) else {
            continue;
        };
        let code = normalize_code(&code);
        let name = sheet
            .text(row, layout.name_column.index())
            .unwrap_or_else(|| code.clone());
        let mut indicator = Indicator::new(&code, name, kind);
        indicator.short_name = optional_text(sheet, row, layout.short_name_column);
        indicator.weight = layout
            .weight_column
            .and_then(|c| parse_weight(sheet.cell(row, c.index())));
        match kind {
            IndicatorType::Subindex => current_subindex = Some(code.clone()),
            IndicatorType::Component => {
                if current_subindex.is_none() {
                    warn!("Component {} in '{}' has no SUBINDEX above it", code, sheet.name);
                }
                indicator.subindex_code = current_subindex.clone();
            }
            IndicatorType::Primary | IndicatorType::Secondary => {
                warn!(
                    "{} {} belongs on the indicator sheet, row {} of '{}' skipped",
                    kind,
                    code,
                    row + 1,
                    sheet.name
                );
                continue;
            }
            IndicatorType::Index => {}
        }
        rows.push(indicator);
    }
    link_to_index(&mut rows);
    rows
}

fn link_to_index(indicators: &mut [Indicator]) {
    let index_code = indicators
        .iter()
        .find(|i| i.kind == Some(IndicatorType::Index))
        .map(|i| i.code.clone());
    for indicator in indicators.iter_mut() {
        if indicator.kind != Some(IndicatorType::Index) {
            indicator.index_code = index_code.clone();
        }
    }
}

/// PRIMARY and SECONDARY rows with their metadata.
pub fn parse_indicator_sheet(sheet: &Sheet, layout: &IndicatorSheet, index_code: Option<&str>) -> Vec<Indicator> {
    let mut rows = Vec::new();
    for row in layout.start_row..sheet.row_count() {
        let Some(code) = sheet.text(row, layout.code_column.index()) else {
            continue;
        };
        let Some(kind) = parse_type(sheet.text(row, layout.type_column.index()), sheet, row) else {
            continue;
        };
        if !kind.is_leaf() {
            warn!(
                "{} {} belongs on the structure sheet, row {} of '{}' skipped",
                kind,
                code,
                row + 1,
                sheet.name
            );
            continue;
        }
        let name = sheet
            .text(row, layout.name_column.index())
            .unwrap_or_else(|| code.clone());
        let subindex = sheet.text(row, layout.subindex_column.index());
        let component = sheet.text(row, layout.component_column.index());
        let mut indicator = Indicator::new(&code, name, kind).with_parents(
            index_code,
            subindex.as_deref(),
            component.as_deref(),
        );
        indicator.short_name = optional_text(sheet, row, layout.short_name_column);
        indicator.description = optional_text(sheet, row, layout.description_column);
        indicator.units = optional_text(sheet, row, layout.units_column);
        indicator.provider_name = optional_text(sheet, row, layout.provider_name_column);
        indicator.provider_url = optional_text(sheet, row, layout.provider_url_column);
        indicator.source_name = optional_text(sheet, row, layout.source_name_column);
        indicator.source_url = optional_text(sheet, row, layout.source_url_column);
        indicator.source_data = optional_text(sheet, row, layout.source_data_column);
        indicator.license = optional_text(sheet, row, layout.license_column);
        indicator.range = optional_text(sheet, row, layout.range_column);
        indicator.format_notes = optional_text(sheet, row, layout.format_notes_column);
        indicator.tags = optional_text(sheet, row, layout.tags_column);
        indicator.weight = layout
            .weight_column
            .and_then(|c| parse_weight(sheet.cell(row, c.index())));
        rows.push(indicator);
    }
    rows
}

/// Inserts every indicator, skipping duplicated codes, and validates the
/// resulting hierarchy.
pub fn build_tree(indicators: Vec<Indicator>) -> Result<IndicatorTree> {
    let mut tree = IndicatorTree::new();
    for indicator in indicators {
        match tree.insert(indicator) {
            Ok(()) => {}
            Err(e @ SurveyError::DuplicateIndicator { .. }) => warn!("{}, keeping the first one", e),
            Err(e) => return Err(e.into()),
        }
    }
    tree.validate().context("Indicator hierarchy is inconsistent")?;
    Ok(tree)
}

pub fn parse_indicators(workbook: &Workbook, access: &StructureAccess) -> Result<IndicatorTree> {
    info!("Parsing indicators");
    let structure_sheet = workbook
        .sheet(&access.structure.sheet)
        .with_context(|| format!("Structure sheet {} not found", access.structure.sheet))?;
    let indicator_sheet = workbook
        .sheet(&access.indicators.sheet)
        .with_context(|| format!("Indicator sheet {} not found", access.indicators.sheet))?;

    let mut indicators = parse_structure_sheet(structure_sheet, &access.structure);
    let index_code = indicators
        .iter()
        .find(|i| i.kind == Some(IndicatorType::Index))
        .map(|i| i.code.clone());
    indicators.extend(parse_indicator_sheet(
        indicator_sheet,
        &access.indicators,
        index_code.as_deref(),
    ));
    let tree = build_tree(indicators)?;
    info!("Parsed {} indicators", tree.len());
    Ok(tree)
}
