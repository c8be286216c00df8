//! Area parser: countries from the area sheet, regions synthesized from the
//! distinct region names.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use survey::{Area, AreaIndex};
use tracing::{error, info, warn};

use crate::config::{region_code, AreaAccess, RegionCode};
use crate::workbook::{Sheet, Workbook};

pub fn parse_area_sheet(
    sheet: &Sheet,
    access: &AreaAccess,
    regions: &BTreeMap<String, RegionCode>,
) -> AreaIndex {
    let mut index = AreaIndex::new();
    let mut unknown_regions: Vec<String> = Vec::new();
    for row in access.start_row..sheet.row_count() {
        let Some(iso3) = sheet.text(row, access.iso3_column.index()) else {
            continue;
        };
        let iso2 = sheet.text(row, access.iso2_column.index()).unwrap_or_default();
        let name = sheet
            .text(row, access.name_column.index())
            .unwrap_or_else(|| iso3.clone());

        let region = match sheet.text(row, access.region_column.index()) {
            Some(region_name) => match region_code(regions, &region_name) {
                Some((canonical, code)) => {
                    if index.find_by_iso3(&code.iso3).is_err() {
                        index.insert(Area::region(&code.iso3, &code.iso2, canonical));
                    }
                    code.iso3.clone()
                }
                None => {
                    if !unknown_regions.contains(&region_name) {
                        error!("Region '{}' has no ISO code configured, its countries are skipped", region_name);
                        unknown_regions.push(region_name);
                    }
                    continue;
                }
            },
            None => {
                warn!("Area {} has no region, skipped", iso3);
                continue;
            }
        };

        let mut country = Area::country(&iso3, &iso2, &name, Some(region.as_str()));
        country.income = access
            .income_column
            .and_then(|c| sheet.text(row, c.index()));
        if index.insert(country).is_some() {
            warn!("Area {} listed twice in '{}', keeping the last row", iso3, sheet.name);
        }
    }
    index
}

pub fn parse_areas(
    workbook: &Workbook,
    access: &AreaAccess,
    regions: &BTreeMap<String, RegionCode>,
) -> Result<AreaIndex> {
    info!("Parsing areas");
    let sheet = workbook
        .sheet(&access.sheet)
        .with_context(|| format!("Area sheet {} not found", access.sheet))?;
    let areas = parse_area_sheet(sheet, access, regions);
    info!(
        "Parsed {} countries in {} regions",
        areas.countries().count(),
        areas.regions().count()
    );
    Ok(areas)
}
