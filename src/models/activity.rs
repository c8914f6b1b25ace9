//! The unit of work exchanged between the orchestrator, the queue and the
//! stage workers. One activity is uniquely addressed by `(dynamo_key, sk)`;
//! the `action` discriminator selects the stage payload.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::cube::{BandExpression, CompositeFunction, MaskDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    #[serde(rename = "NOTDONE")]
    NotDone,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ERROR")]
    Error,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::NotDone => "NOTDONE",
            ActivityStatus::Done => "DONE",
            ActivityStatus::Error => "ERROR",
        }
    }
}

/// A stage failure surfaced on the activity row. `step` names the stage that
/// failed so operators can tell a merge decode error from a publish catalog
/// miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{step}: {message}")]
pub struct StageError {
    pub step: String,
    pub message: String,
}

impl StageError {
    pub fn new(step: &str, message: impl Into<String>) -> Self {
        Self { step: step.to_string(), message: message.into() }
    }
}

/// Cube-wide constants every stage needs. Copied verbatim from stage to stage
/// so a worker can run from the activity JSON alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeContext {
    pub datacube: String,
    pub irregular_datacube: String,
    pub version: String,
    pub satellite: String,
    pub datasets: Vec<String>,
    pub tileid: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub dirname: String,
    pub bands: Vec<String>,
    pub band_ids: BTreeMap<String, String>,
    pub quality_band: String,
    pub quicklook: Vec<String>,
    pub nodata: i32,
    pub srs: String,
    pub resx: f64,
    pub resy: f64,
    pub functions: Vec<CompositeFunction>,
    pub internal_bands: Vec<String>,
    pub bands_expressions: BTreeMap<String, BandExpression>,
    pub mask: MaskDescriptor,
    pub indexes_only_regular_cube: bool,
    pub force: bool,
    #[serde(default)]
    pub shape: Option<(usize, usize)>,
    /// Tile footprint as GeoJSON in EPSG:4326.
    pub geom: serde_json::Value,
    pub xmin: f64,
    pub ymax: f64,
    pub dist_x: f64,
    pub dist_y: f64,
    pub bucket: String,
}

impl CubeContext {
    pub fn satellite_is(&self, family: &str) -> bool {
        self.satellite.to_uppercase().contains(family)
    }

    pub fn period(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }
}

// ── Stage payloads ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePayload {
    pub band: String,
    pub dataset: String,
    pub date: NaiveDate,
    /// Source asset keys, in scene order.
    pub links: Vec<String>,
    #[serde(default)]
    pub source_nodata: Option<f64>,
    /// Target object key of the merged ARD raster.
    pub ard_file: String,
    /// All dates of the period, used to gather the merge set at blend time.
    pub list_dates: Vec<NaiveDate>,
    pub instances_to_be_done: u64,
    pub total_instances_to_be_done: u64,
}

/// One date's worth of merge outputs referenced by a downstream stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneRef {
    pub date: NaiveDate,
    pub dataset: String,
    pub efficacy: f64,
    pub cloudratio: f64,
    /// band name -> ARD file basename.
    pub ard_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendPayload {
    pub band: String,
    /// Set when this slot derives an internal band (CLEAROB/TOTALOB/PROVENANCE)
    /// from the first user band's merge set.
    #[serde(default)]
    pub internal_band: Option<String>,
    /// date key -> merge outputs for that date.
    pub scenes: BTreeMap<String, SceneRef>,
    /// Composite output keys per non-IDT function.
    pub composites: BTreeMap<CompositeFunction, String>,
    pub instances_to_be_done: u64,
    pub total_instances_to_be_done: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexTarget {
    /// Evaluate over the period composites of each function.
    Composite,
    /// Evaluate over one date's merge outputs.
    Identity { date: NaiveDate },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexInputs {
    /// function -> band name -> composite object key.
    pub composite: BTreeMap<CompositeFunction, BTreeMap<String, String>>,
    /// date -> band name -> ARD object key.
    pub identity: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosblendPayload {
    pub index_name: String,
    pub target: IndexTarget,
    pub inputs: IndexInputs,
    /// Carried forward for publish fan-out.
    pub scenes: BTreeMap<String, SceneRef>,
    pub total_instances_to_be_done: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishScene {
    pub date: NaiveDate,
    pub cloudratio: f64,
    pub ard_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishPayload {
    pub scenes: BTreeMap<String, PublishScene>,
    /// band (or internal band / index name) -> function -> composite key.
    pub blended: BTreeMap<String, BTreeMap<CompositeFunction, String>>,
    pub total_instances_to_be_done: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StagePayload {
    Merge(MergePayload),
    Blend(BlendPayload),
    Posblend(PosblendPayload),
    Publish(PublishPayload),
}

// ── The activity envelope ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "dynamoKey")]
    pub dynamo_key: String,
    pub sk: String,
    pub mystatus: ActivityStatus,
    #[serde(default)]
    pub mylaunch: Option<String>,
    #[serde(default)]
    pub mystart: Option<String>,
    #[serde(default)]
    pub myend: Option<String>,
    pub efficacy: f64,
    pub cloudratio: f64,
    #[serde(default)]
    pub errors: Option<StageError>,
    #[serde(flatten)]
    pub ctx: CubeContext,
    #[serde(flatten)]
    pub stage: StagePayload,
}

/// Key fragments are concatenated without separator, matching the layout the
/// tracking store is keyed by.
pub fn encode_key(parts: &[&str]) -> String {
    parts.concat()
}

impl Activity {
    pub fn action(&self) -> &'static str {
        match self.stage {
            StagePayload::Merge(_) => "merge",
            StagePayload::Blend(_) => "blend",
            StagePayload::Posblend(_) => "posblend",
            StagePayload::Publish(_) => "publish",
        }
    }

    /// The counter-table key this activity reports completion to. Merge keys
    /// collapse the per-date, per-band addressing to the whole `(tile,
    /// period)`; the other stages already use period-level keys.
    pub fn control_key(&self) -> String {
        let start = self.ctx.start.to_string();
        let end = self.ctx.end.to_string();
        match &self.stage {
            StagePayload::Merge(_) => encode_key(&[
                "merge",
                &self.ctx.irregular_datacube,
                &self.ctx.tileid,
                &start,
                &end,
            ]),
            _ => self.dynamo_key.clone(),
        }
    }

    pub fn total_instances(&self) -> u64 {
        match &self.stage {
            StagePayload::Merge(p) => p.total_instances_to_be_done,
            StagePayload::Blend(p) => p.total_instances_to_be_done,
            StagePayload::Posblend(p) => p.total_instances_to_be_done,
            StagePayload::Publish(p) => p.total_instances_to_be_done,
        }
    }

    /// Stage-specific instance count persisted alongside the row, used by the
    /// skip-if-exists checks to detect a changed scene set.
    pub fn instances(&self) -> u64 {
        match &self.stage {
            StagePayload::Merge(p) => p.instances_to_be_done,
            StagePayload::Blend(p) => p.instances_to_be_done,
            StagePayload::Posblend(_) | StagePayload::Publish(_) => 0,
        }
    }

    pub fn mark_error(&mut self, step: &str, message: impl Into<String>) {
        self.mystatus = ActivityStatus::Error;
        self.errors = Some(StageError::new(step, message));
        self.myend = Some(now_stamp());
    }
}

/// Control-table keys for every stage of one `(tile, period)`, used by the
/// force path to wipe prior state.
pub fn stage_control_keys(
    datacube: &str,
    irregular_datacube: &str,
    tileid: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> [String; 4] {
    let start = start.to_string();
    let end = end.to_string();
    [
        encode_key(&["merge", irregular_datacube, tileid, &start, &end]),
        encode_key(&["blend", datacube, tileid, &start, &end]),
        encode_key(&["posblend", datacube, tileid, &start, &end]),
        encode_key(&["publish", datacube, tileid, &start, &end]),
    ]
}

pub fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
