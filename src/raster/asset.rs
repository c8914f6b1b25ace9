//! Catalog asset definitions derived from stored rasters.

use serde_json::{json, Value};

use super::{Buffer, Raster};

/// Polygon ring for the raster's full extent, in the raster CRS.
pub fn extent_geom(raster: &Raster) -> Value {
    let t = raster.transform;
    let x_max = t.x_min + raster.width() as f64 * t.res_x;
    let y_min = t.y_max - raster.height() as f64 * t.res_y;
    bbox_polygon(t.x_min, y_min, x_max, t.y_max)
}

/// Bounding polygon of the valid-data pixels. Falls back to the full extent
/// when every pixel carries data, degenerates to the extent when none does.
pub fn convex_hull(raster: &Raster) -> Value {
    let Some(nodata) = raster.nodata else {
        return extent_geom(raster);
    };

    let mut min_row = usize::MAX;
    let mut max_row = 0usize;
    let mut min_col = usize::MAX;
    let mut max_col = 0usize;
    let mut any = false;

    let mut visit = |row: usize, col: usize| {
        any = true;
        min_row = min_row.min(row);
        max_row = max_row.max(row);
        min_col = min_col.min(col);
        max_col = max_col.max(col);
    };

    match &raster.buffer {
        Buffer::U8(a) => {
            let nd = nodata as u8;
            for ((r, c), &v) in a.indexed_iter() {
                if v != nd {
                    visit(r, c);
                }
            }
        }
        Buffer::U16(a) => {
            let nd = nodata as u16;
            for ((r, c), &v) in a.indexed_iter() {
                if v != nd {
                    visit(r, c);
                }
            }
        }
        Buffer::I16(a) => {
            let nd = nodata as i16;
            for ((r, c), &v) in a.indexed_iter() {
                if v != nd {
                    visit(r, c);
                }
            }
        }
    }

    if !any {
        return extent_geom(raster);
    }

    let t = raster.transform;
    let x_min = t.x_min + min_col as f64 * t.res_x;
    let x_max = t.x_min + (max_col + 1) as f64 * t.res_x;
    let y_max = t.y_max - min_row as f64 * t.res_y;
    let y_min = t.y_max - (max_row + 1) as f64 * t.res_y;
    bbox_polygon(x_min, y_min, x_max, y_max)
}

fn bbox_polygon(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [x_min, y_min],
            [x_max, y_min],
            [x_max, y_max],
            [x_min, y_max],
            [x_min, y_min],
        ]]
    })
}

/// Build a catalog asset entry. Raster assets additionally report their
/// footprint geometry and valid-data hull for the item record.
pub fn create_asset_definition(
    href: &str,
    mime: &str,
    roles: &[&str],
    raster: Option<&Raster>,
) -> (Value, Option<Value>, Option<Value>) {
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut asset = json!({
        "href": href,
        "type": mime,
        "roles": roles,
        "created": created,
        "updated": created,
    });

    let Some(raster) = raster else {
        return (asset, None, None);
    };

    let pixel_type = match raster.buffer {
        Buffer::U8(_) => "uint8",
        Buffer::U16(_) => "uint16",
        Buffer::I16(_) => "int16",
    };
    asset["raster:size"] = json!([raster.width(), raster.height()]);
    asset["raster:resolution"] = json!([raster.transform.res_x, raster.transform.res_y]);
    asset["raster:data_type"] = json!(pixel_type);
    if let Some(nodata) = raster.nodata {
        asset["raster:nodata"] = json!(nodata);
    }
    asset["proj:epsg"] = json!(raster.crs);

    (asset, Some(extent_geom(raster)), Some(convex_hull(raster)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;
    use ndarray::Array2;

    fn raster_with(data: Array2<i16>) -> Raster {
        Raster {
            buffer: Buffer::I16(data),
            transform: GeoTransform { res_x: 10.0, res_y: 10.0, x_min: 100.0, y_max: 200.0 },
            crs: "EPSG:32723".to_string(),
            nodata: Some(-9999.0),
        }
    }

    #[test]
    fn extent_covers_the_grid() {
        let raster = raster_with(Array2::from_elem((4, 6), 1i16));
        let geom = extent_geom(&raster);
        let ring = geom["coordinates"][0].as_array().unwrap();
        assert_eq!(ring[0], serde_json::json!([100.0, 160.0]));
        assert_eq!(ring[2], serde_json::json!([160.0, 200.0]));
    }

    #[test]
    fn hull_shrinks_to_valid_data() {
        let mut data = Array2::from_elem((4, 4), -9999i16);
        data[[1, 1]] = 5;
        data[[2, 2]] = 6;
        let hull = convex_hull(&raster_with(data));
        let ring = hull["coordinates"][0].as_array().unwrap();
        // Valid pixels span rows 1..=2, cols 1..=2.
        assert_eq!(ring[0], serde_json::json!([110.0, 170.0]));
        assert_eq!(ring[2], serde_json::json!([130.0, 190.0]));
    }

    #[test]
    fn asset_reports_raster_metadata() {
        let raster = raster_with(Array2::from_elem((4, 6), 1i16));
        let (asset, geom, hull) = create_asset_definition(
            "cubes/x.tif",
            super::super::COG_MIME_TYPE,
            &["data"],
            Some(&raster),
        );
        assert_eq!(asset["raster:data_type"], "int16");
        assert_eq!(asset["raster:size"], serde_json::json!([6, 4]));
        assert!(geom.is_some());
        assert!(hull.is_some());
    }

    #[test]
    fn thumbnail_asset_has_no_geometry() {
        let (asset, geom, hull) =
            create_asset_definition("ql.png", "image/png", &["thumbnail"], None);
        assert_eq!(asset["roles"], serde_json::json!(["thumbnail"]));
        assert!(geom.is_none());
        assert!(hull.is_none());
    }
}
