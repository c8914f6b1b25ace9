//! Initial fan-out: resolve tiles, mount the timeline, and build the item
//! skeleton every `(tile, period)` of a run hangs off.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog_db::CatalogDb;
use crate::models::CubeDescriptor;
use crate::timeline;

/// One `(tile, period)` slot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodItem {
    pub tile_id: i64,
    pub tile_name: String,
    pub item_date: String,
    pub id: String,
    pub dirname: String,
    pub composite_start: NaiveDate,
    pub composite_end: NaiveDate,
    #[serde(default)]
    pub shape: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileItems {
    pub geom: serde_json::Value,
    pub xmin: f64,
    pub ymax: f64,
    pub dist_x: f64,
    pub dist_y: f64,
    /// period key (`start_end`) -> item skeleton.
    pub periods: BTreeMap<String, PeriodItem>,
}

/// tile name -> its periods.
pub type ItemSkeleton = BTreeMap<String, TileItems>;

/// Enumerate the `(tile, period)` items of a run.
///
/// Periods whose window crosses the requested `[start, end]` range are
/// dropped; item ids are unique by construction and duplicates (a tile listed
/// twice) collapse onto one entry.
pub fn orchestrate(
    catalog: &CatalogDb,
    cube: &CubeDescriptor,
    tile_names: &[String],
    start: NaiveDate,
    end: NaiveDate,
    shape: Option<(usize, usize)>,
    item_prefix: Option<&str>,
) -> anyhow::Result<ItemSkeleton> {
    let version = cube.formatted_version();
    let irregular = cube.irregular_name();
    let tiles = catalog.tiles_by_names(cube.grid_ref_sys_id, tile_names)?;
    anyhow::ensure!(!tiles.is_empty(), "none of the requested tiles exist in the grid");

    let periods = timeline::mount(&cube.temporal_schema, start, end);

    let mut items = ItemSkeleton::new();
    let mut seen_ids = Vec::new();

    for period in &periods {
        if period.start < start || period.end > end {
            continue;
        }

        for tile in &tiles {
            let entry = items.entry(tile.name.clone()).or_insert_with(|| TileItems {
                geom: tile.geom.clone(),
                xmin: tile.xmin,
                ymax: tile.ymax,
                dist_x: tile.dist_x,
                dist_y: tile.dist_y,
                periods: BTreeMap::new(),
            });

            let period_key = period.key();
            let item_id = format!("{irregular}_{version}_{}_{period_key}", tile.name);
            if seen_ids.contains(&item_id) {
                continue;
            }
            seen_ids.push(item_id.clone());

            let dirname = match item_prefix {
                Some(prefix) if !prefix.is_empty() => {
                    format!("{}/{irregular}/{version}/{}/", prefix.trim_end_matches('/'), tile.name)
                }
                _ => format!("{irregular}/{version}/{}/", tile.name),
            };

            entry.periods.insert(
                period_key.clone(),
                PeriodItem {
                    tile_id: tile.id,
                    tile_name: tile.name.clone(),
                    item_date: period_key,
                    id: item_id,
                    dirname,
                    composite_start: period.start,
                    composite_end: period.end,
                    shape,
                },
            );
        }
    }

    Ok(items)
}

/// Parameters of one build trigger, from the HTTP API or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeStartRequest {
    pub datacube: String,
    pub version: u32,
    pub tiles: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub shape: Option<(usize, usize)>,
    #[serde(default)]
    pub item_prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartSummary {
    pub cube: String,
    pub tiles: usize,
    pub periods: usize,
    /// `(tile, period)` keys skipped because they were already published.
    pub skipped: Vec<String>,
}

/// Resolve the cube, fan out the item skeleton and schedule the merges.
pub async fn start_cube_build(
    services: &crate::services::Services,
    request: &CubeStartRequest,
) -> anyhow::Result<StartSummary> {
    let cube = services
        .catalog
        .get_cube(&request.datacube, request.version)?
        .ok_or_else(|| {
            anyhow::anyhow!("cube {} version {} is not registered", request.datacube, request.version)
        })?;

    let prefix = request.item_prefix.clone().or_else(|| services.item_prefix.clone());
    let items = orchestrate(
        &services.catalog,
        &cube,
        &request.tiles,
        request.start_date,
        request.end_date,
        request.shape,
        prefix.as_deref(),
    )?;

    let periods = items.values().map(|tile| tile.periods.len()).sum();
    let skipped = crate::merge::prepare_merge(services, &cube, &items, request.force).await?;

    Ok(StartSummary {
        cube: cube.name.clone(),
        tiles: items.len(),
        periods,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::TileRow;
    use crate::models::cube::tests::sample_cube;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seeded_catalog() -> (tempfile::TempDir, CatalogDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CatalogDb::open(dir.path().join("catalog.db").to_str().unwrap()).unwrap();
        db.create_grid(1, "BDC_MD").unwrap();
        for (id, name) in [(10, "089098"), (11, "089099")] {
            db.create_tile(&TileRow {
                id,
                grid_ref_sys_id: 1,
                name: name.to_string(),
                geom: json!({"type": "Polygon", "coordinates": [[[-46.0, -23.0], [-45.0, -23.0], [-45.0, -22.0], [-46.0, -22.0], [-46.0, -23.0]]]}),
                xmin: 500_000.0,
                ymax: 8_000_000.0,
                dist_x: 3000.0,
                dist_y: 3000.0,
            })
            .unwrap();
        }
        (dir, db)
    }

    #[test]
    fn builds_items_per_tile_and_period() {
        let (_dir, catalog) = seeded_catalog();
        let cube = sample_cube();

        let items = orchestrate(
            &catalog,
            &cube,
            &["089098".to_string(), "089099".to_string()],
            date(2024, 1, 1),
            date(2024, 2, 1),
            None,
            None,
        )
        .unwrap();

        assert_eq!(items.len(), 2);
        let tile = &items["089098"];
        assert_eq!(tile.dist_x, 3000.0);
        // 16-day yearly cycle: two full periods fit in Jan 1 - Feb 1.
        assert_eq!(tile.periods.len(), 2);
        let first = &tile.periods["2024-01-01_2024-01-16"];
        assert_eq!(first.id, "LC8_30_IDT_001_089098_2024-01-01_2024-01-16");
        assert_eq!(first.dirname, "LC8_30_IDT/001/089098/");
        assert_eq!(first.composite_end, date(2024, 1, 16));
    }

    #[test]
    fn periods_outside_the_range_are_dropped() {
        let (_dir, catalog) = seeded_catalog();
        let cube = sample_cube();

        // Start mid-period: the cycle anchors on Jan 1, so the clipped first
        // period is dropped rather than shortened.
        let items = orchestrate(
            &catalog,
            &cube,
            &["089098".to_string()],
            date(2024, 1, 10),
            date(2024, 2, 5),
            None,
            None,
        )
        .unwrap();

        let tile = &items["089098"];
        assert!(tile.periods.keys().all(|k| k.starts_with("2024-01-17") || k.starts_with("2024-02-02")));
    }

    #[test]
    fn duplicate_tiles_are_suppressed() {
        let (_dir, catalog) = seeded_catalog();
        let cube = sample_cube();

        let items = orchestrate(
            &catalog,
            &cube,
            &["089098".to_string(), "089098".to_string()],
            date(2024, 1, 1),
            date(2024, 1, 16),
            None,
            None,
        )
        .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items["089098"].periods.len(), 1);
    }

    #[test]
    fn prefix_and_shape_flow_into_items() {
        let (_dir, catalog) = seeded_catalog();
        let cube = sample_cube();

        let items = orchestrate(
            &catalog,
            &cube,
            &["089098".to_string()],
            date(2024, 1, 1),
            date(2024, 1, 16),
            Some((100, 100)),
            Some("composites"),
        )
        .unwrap();

        let item = &items["089098"].periods["2024-01-01_2024-01-16"];
        assert_eq!(item.dirname, "composites/LC8_30_IDT/001/089098/");
        assert_eq!(item.shape, Some((100, 100)));
    }

    #[test]
    fn unknown_tiles_error() {
        let (_dir, catalog) = seeded_catalog();
        let cube = sample_cube();
        let result = orchestrate(
            &catalog,
            &cube,
            &["nowhere".to_string()],
            date(2024, 1, 1),
            date(2024, 1, 16),
            None,
            None,
        );
        assert!(result.is_err());
    }
}
