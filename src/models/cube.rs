use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Composite functions a cube can produce. `Idt` is the per-date passthrough
/// and never materializes a composite raster of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompositeFunction {
    #[serde(rename = "IDT")]
    Idt,
    #[serde(rename = "STK")]
    Stk,
    #[serde(rename = "MED")]
    Med,
}

impl CompositeFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeFunction::Idt => "IDT",
            CompositeFunction::Stk => "STK",
            CompositeFunction::Med => "MED",
        }
    }
}

impl std::fmt::Display for CompositeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel-value categories of the quality band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskDescriptor {
    pub nodata: u16,
    pub clear_data: Vec<u16>,
    pub not_clear_data: Vec<u16>,
    #[serde(default)]
    pub saturated_data: Vec<u16>,
}

impl MaskDescriptor {
    pub fn is_clear(&self, value: u16) -> bool {
        self.clear_data.contains(&value)
    }

    pub fn is_not_clear(&self, value: u16) -> bool {
        self.not_clear_data.contains(&value)
    }

    pub fn is_saturated(&self, value: u16) -> bool {
        self.saturated_data.contains(&value)
    }
}

/// A spectral-index definition: an arithmetic expression over band names,
/// plus the catalog ids of the bands it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandExpression {
    pub expression: String,
    pub band_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Day,
    Month,
    Year,
}

/// Temporal compositing schema: periods of `step` `unit`s, optionally
/// restarting at each `cycle` boundary (e.g. 16-day periods per year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalSchema {
    pub step: u32,
    pub unit: TimeUnit,
    #[serde(default)]
    pub cycle: Option<CycleSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSchema {
    pub step: u32,
    pub unit: TimeUnit,
}

/// The internal bands every regular cube carries alongside its user bands.
pub const INTERNAL_BANDS: [&str; 3] = ["CLEAROB", "TOTALOB", "PROVENANCE"];

/// Immutable description of a data cube, resolved from the catalog before a
/// run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeDescriptor {
    /// Regular cube name, e.g. `LC8_30_16D_STK` family root `LC8_30`.
    pub name: String,
    pub version: u32,
    pub grid_ref_sys_id: i64,
    /// Source collections queried in the STAC catalogs.
    pub datasets: Vec<String>,
    /// Satellite family, e.g. `LANDSAT-8`, `SENTINEL-2`, `CBERS-4`.
    pub satellite: String,
    /// Ordered user bands.
    pub bands: Vec<String>,
    /// Catalog band id -> band name.
    pub band_ids: BTreeMap<String, String>,
    pub quality_band: String,
    /// RGB composition used for quicklooks.
    pub quicklook: [String; 3],
    pub nodata: i32,
    pub crs: String,
    pub resx: f64,
    pub resy: f64,
    pub functions: Vec<CompositeFunction>,
    pub bands_expressions: BTreeMap<String, BandExpression>,
    pub mask: MaskDescriptor,
    pub temporal_schema: TemporalSchema,
    #[serde(default)]
    pub indexes_only_regular_cube: bool,
}

impl CubeDescriptor {
    /// Three-digit version string used in ids and paths.
    pub fn formatted_version(&self) -> String {
        format!("{:03}", self.version)
    }

    /// Name of the irregular (per-date identity) cube companion.
    pub fn irregular_name(&self) -> String {
        format!("{}_IDT", self.name)
    }

    pub fn satellite_is(&self, family: &str) -> bool {
        self.satellite.to_uppercase().contains(family)
    }
}
