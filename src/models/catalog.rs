use serde::{Deserialize, Serialize};

/// A registered cube collection (regular or irregular flavor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub grid_ref_sys_id: i64,
}

/// A spatial cell of a grid reference system, with its projected bounding box
/// denormalized from the grid geometry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileRow {
    pub id: i64,
    pub grid_ref_sys_id: i64,
    pub name: String,
    /// Footprint as GeoJSON in EPSG:4326.
    pub geom: serde_json::Value,
    pub xmin: f64,
    pub ymax: f64,
    pub dist_x: f64,
    pub dist_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandRow {
    pub id: i64,
    pub collection_id: i64,
    pub name: String,
    pub common_name: String,
    pub data_type: String,
}

/// A catalog item draft: one `(collection, name)` entry with its assets,
/// committed by publish in a single transaction per `(tile, period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDraft {
    pub collection_id: i64,
    pub tile_id: i64,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub cloud_cover: f64,
    pub assets: serde_json::Value,
    pub geom: serde_json::Value,
    pub min_convex_hull: serde_json::Value,
    pub srid: i64,
    pub application_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRow {
    pub id: String,
    pub collection_id: i64,
    pub tile_id: i64,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub cloud_cover: f64,
    pub assets: serde_json::Value,
    pub geom: serde_json::Value,
    pub min_convex_hull: serde_json::Value,
    pub srid: i64,
    pub application_id: i64,
    pub created_at: String,
    pub updated_at: String,
}
