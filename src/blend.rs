//! BLEND: temporal compositing of one band across the dates of a period,
//! plus the derived CLEAROB / TOTALOB / PROVENANCE rasters.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use ndarray::Array2;

use crate::dispatcher::{commit_activity, next_step};
use crate::models::activity::{encode_key, now_stamp};
use crate::models::{
    Activity, ActivityStatus, BlendPayload, CompositeFunction, CubeContext, MaskDescriptor,
    SceneRef, StageError, StagePayload,
};
use crate::raster::quality::qa_statistics;
use crate::raster::{block_windows, cog, Buffer, Raster};
use crate::queue::ActivityQueue;
use crate::services::Services;
use crate::storage::{key_basename, ObjectStore};

/// Normalization constant for the efficacy ordering score.
const COMPOSITE_RESOLUTION: f64 = 10.0;

/// Composite object key for one `(function, band)`.
pub(crate) fn composite_path(
    datacube: &str,
    func: CompositeFunction,
    version: &str,
    tileid: &str,
    start: NaiveDate,
    end: NaiveDate,
    band: &str,
) -> String {
    let cube_id = format!("{datacube}_{func}");
    format!(
        "{cube_id}/{version}/{tileid}/{start}_{end}/{cube_id}_{version}_{tileid}_{start}_{end}_{band}.tif"
    )
}

/// Swap the trailing `_{band}.tif` of an output key for another band name.
pub(crate) fn replace_band_suffix(path: &str, new_band: &str) -> String {
    match path.strip_suffix(".tif").and_then(|stem| stem.rsplit_once('_')) {
        Some((prefix, _)) => format!("{prefix}_{new_band}.tif"),
        None => format!("{path}_{new_band}.tif"),
    }
}

/// Output keys for one blend slot. The quality band only composes STK;
/// PROVENANCE is only meaningful for STK; everything else gets one output per
/// configured non-identity function.
pub(crate) fn composites_for_slot(
    ctx: &CubeContext,
    slot: &str,
    internal: bool,
) -> BTreeMap<CompositeFunction, String> {
    let mut out = BTreeMap::new();
    for func in &ctx.functions {
        if *func == CompositeFunction::Idt {
            continue;
        }
        if (slot == ctx.quality_band || internal && slot == "PROVENANCE")
            && *func != CompositeFunction::Stk
        {
            continue;
        }
        out.insert(
            *func,
            composite_path(
                &ctx.datacube,
                *func,
                &ctx.version,
                &ctx.tileid,
                ctx.start,
                ctx.end,
                slot,
            ),
        );
    }
    out
}

/// Collect the merge rows of one band across the period's dates.
///
/// Returns `None` when any date has no row yet or a row is not `DONE` — the
/// signal that the merge set is incomplete.
fn gather_merge_scenes(
    services: &Services,
    ctx: &CubeContext,
    list_dates: &[NaiveDate],
    band: &str,
) -> anyhow::Result<Option<BTreeMap<String, SceneRef>>> {
    let mut dates: Vec<String> = list_dates.iter().map(|d| d.to_string()).collect();
    dates.sort();
    dates.dedup();

    let mut scenes: BTreeMap<String, SceneRef> = BTreeMap::new();
    for date in &dates {
        let key = encode_key(&["merge", &ctx.irregular_datacube, &ctx.tileid, date, band]);
        let rows = services.tracking.activities_by_key(&key)?;
        if rows.is_empty() {
            return Ok(None);
        }
        for row in rows {
            if row.status != ActivityStatus::Done {
                return Ok(None);
            }
            let StagePayload::Merge(payload) = &row.activity.stage else { continue };
            let scene = scenes.entry(row.sk.clone()).or_insert_with(|| SceneRef {
                date: payload.date,
                dataset: payload.dataset.clone(),
                efficacy: row.efficacy,
                cloudratio: row.cloudratio,
                ard_files: BTreeMap::new(),
            });
            scene
                .ard_files
                .insert(band.to_string(), key_basename(&payload.ard_file).to_string());
        }
    }
    Ok(Some(scenes))
}

/// Fan out one blend activity per band and internal band once every merge of
/// the `(tile, period)` finished.
pub async fn next_blend(services: &Services, merge_activity: &Activity) -> anyhow::Result<()> {
    let StagePayload::Merge(merge_payload) = &merge_activity.stage else {
        anyhow::bail!("next_blend requires a merge activity");
    };
    let ctx = &merge_activity.ctx;
    let start = ctx.start.to_string();
    let end = ctx.end.to_string();
    let blend_key = encode_key(&["blend", &ctx.datacube, &ctx.tileid, &start, &end]);
    let total = (ctx.bands.len() + ctx.internal_bands.len()) as u64;

    let quality_scenes =
        gather_merge_scenes(services, ctx, &merge_payload.list_dates, &ctx.quality_band)?;
    services.tracking.put_control(&blend_key, 0, total as i64, &now_stamp())?;

    let quality_scenes = match quality_scenes {
        Some(scenes) if !scenes.is_empty() => scenes,
        _ => {
            let mut activity = blend_activity_template(ctx, &blend_key, "ALLBANDS", total);
            activity.mark_error("next_blend", "not all merges were found for this tile/period");
            commit_activity(services, &activity).await?;
            return Ok(());
        }
    };

    let slots: Vec<(String, bool)> = ctx
        .bands
        .iter()
        .map(|b| (b.clone(), false))
        .chain(ctx.internal_bands.iter().map(|b| (b.clone(), true)))
        .collect();

    for (slot, internal) in slots {
        // Internal bands derive their pixels from the first user band.
        let data_band = if internal {
            ctx.bands.first().cloned().unwrap_or_else(|| ctx.quality_band.clone())
        } else {
            slot.clone()
        };

        let mut scenes = quality_scenes.clone();
        if data_band != ctx.quality_band {
            if let Some(band_scenes) =
                gather_merge_scenes(services, ctx, &merge_payload.list_dates, &data_band)?
            {
                for (date_ref, band_scene) in band_scenes {
                    if let Some(scene) = scenes.get_mut(&date_ref) {
                        scene.ard_files.extend(band_scene.ard_files);
                    }
                }
            }
        }

        let instances = scenes.len() as u64;
        let composites = composites_for_slot(ctx, &slot, internal);

        let mut activity = blend_activity_template(ctx, &blend_key, &slot, total);
        activity.stage = StagePayload::Blend(BlendPayload {
            band: data_band,
            internal_band: internal.then(|| slot.clone()),
            scenes,
            composites: composites.clone(),
            instances_to_be_done: instances,
            total_instances_to_be_done: total,
        });

        if let Some(existing) = services.tracking.get_activity(&blend_key, &slot)? {
            if existing.status == ActivityStatus::Done && existing.instances == instances as i64 {
                let mut all_outputs_exist = true;
                for path in composites.values() {
                    if !services.storage.head(&ctx.bucket, path).await? {
                        all_outputs_exist = false;
                        break;
                    }
                }
                if !ctx.force && all_outputs_exist {
                    next_step(services, &activity).await?;
                    continue;
                }
            }
            services.tracking.remove_activity(&blend_key, &slot)?;
        }

        services.tracking.put_activity(&activity)?;
        services.queue.send(&activity).await?;
    }

    Ok(())
}

fn blend_activity_template(ctx: &CubeContext, key: &str, sk: &str, total: u64) -> Activity {
    Activity {
        dynamo_key: key.to_string(),
        sk: sk.to_string(),
        mystatus: ActivityStatus::NotDone,
        mylaunch: Some(now_stamp()),
        mystart: None,
        myend: None,
        efficacy: 0.0,
        cloudratio: 100.0,
        errors: None,
        ctx: ctx.clone(),
        stage: StagePayload::Blend(BlendPayload {
            band: ctx.quality_band.clone(),
            internal_band: None,
            scenes: BTreeMap::new(),
            composites: BTreeMap::new(),
            instances_to_be_done: 0,
            total_instances_to_be_done: total,
        }),
    }
}

// ── Worker ──

/// Scene processing order: descending efficacy score, ties broken by
/// ascending date key so reruns are bit-identical.
pub(crate) fn blend_order(scenes: &BTreeMap<String, SceneRef>) -> Vec<String> {
    let mut tuples: Vec<(f64, String)> = scenes
        .iter()
        .map(|(key, scene)| (100.0 * scene.efficacy / COMPOSITE_RESOLUTION, key.clone()))
        .collect();
    tuples.sort_by(|a, b| {
        b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal).then_with(|| a.1.cmp(&b.1))
    });
    tuples.into_iter().map(|(_, key)| key).collect()
}

pub(crate) struct SceneArrays {
    pub date: NaiveDate,
    pub band: Array2<i16>,
    pub quality: Array2<u16>,
}

pub(crate) struct CompositeOutputs {
    pub stack: Array2<i16>,
    pub median: Array2<i16>,
    pub clearob: Array2<u8>,
    pub totalob: Array2<u8>,
    pub provenance: Array2<i16>,
}

fn is_clear_observation(mask: &MaskDescriptor, value: u16, raster: i16, nodata: i16) -> bool {
    if raster == nodata || value == mask.nodata {
        return false;
    }
    if mask.is_not_clear(value) || mask.is_saturated(value) {
        return false;
    }
    if mask.is_clear(value) {
        return true;
    }
    // Values outside every category keep their nonzero truthiness.
    value != 0
}

/// One pass over the scene stack, in blend order, computing the best-pixel
/// composite, the median composite and the observation statistics.
pub(crate) fn composite(
    scenes: &[SceneArrays],
    mask: &MaskDescriptor,
    nodata: i16,
) -> CompositeOutputs {
    let shape = scenes[0].band.dim();
    let days: Vec<i16> = scenes.iter().map(|s| s.date.ordinal() as i16).collect();

    let mut stack = Array2::from_elem(shape, nodata);
    let mut median = Array2::from_elem(shape, nodata);
    let mut clearob: Array2<u8> = Array2::zeros(shape);
    let mut totalob: Array2<u8> = Array2::zeros(shape);
    let mut provenance = Array2::from_elem(shape, -1i16);

    let mut clear_values: Vec<i16> = Vec::with_capacity(scenes.len());

    for window in block_windows(shape.0, shape.1) {
        for row in window.rows() {
            for col in window.cols() {
                let mut stack_value = nodata;
                let mut provenance_value = -1i16;
                let mut notdone = true;
                let mut total = 0u16;
                clear_values.clear();

                for (order, scene) in scenes.iter().enumerate() {
                    let raster = scene.band[[row, col]];
                    let quality = scene.quality[[row, col]];
                    let valid = raster != nodata;
                    let clear = is_clear_observation(mask, quality, raster, nodata);

                    // Gap-fill: the first observation with any data claims a
                    // still-empty stack pixel.
                    if stack_value == nodata && valid {
                        stack_value = raster;
                        provenance_value = days[order];
                    }
                    // Best clear observation wins while the pixel is open.
                    if notdone && clear {
                        stack_value = raster;
                        provenance_value = days[order];
                    }

                    if clear {
                        clear_values.push(raster);
                    }
                    if valid {
                        total += 1;
                    }
                    notdone = notdone && !clear;
                }

                stack[[row, col]] = stack_value;
                provenance[[row, col]] = provenance_value;
                clearob[[row, col]] = clear_values.len().min(255) as u8;
                totalob[[row, col]] = total.min(255) as u8;
                median[[row, col]] = if clear_values.is_empty() {
                    nodata
                } else {
                    clear_values.sort_unstable();
                    let mid = clear_values.len() / 2;
                    if clear_values.len() % 2 == 1 {
                        clear_values[mid]
                    } else {
                        // Truncating mean of the middle pair.
                        ((f64::from(clear_values[mid - 1]) + f64::from(clear_values[mid])) / 2.0)
                            as i16
                    }
                };
            }
        }
    }

    CompositeOutputs { stack, median, clearob, totalob, provenance }
}

struct BlendOutcome {
    quality_stats: Option<(f64, f64)>,
}

/// Composite one band (or internal band) across the period.
pub async fn blend(services: &Services, mut activity: Activity) -> Activity {
    activity.mystart = Some(now_stamp());

    match run_blend(services, &activity).await {
        Ok(outcome) => {
            activity.mystatus = ActivityStatus::Done;
            activity.myend = Some(now_stamp());
            if let Some((efficacy, cloudratio)) = outcome.quality_stats {
                activity.efficacy = efficacy;
                activity.cloudratio = cloudratio;
            }
        }
        Err(e) => activity.mark_error("blend", e.message),
    }

    if let Err(e) = commit_activity(services, &activity).await {
        tracing::error!("blend {}: tracking update failed: {e}", activity.dynamo_key);
    }
    activity
}

async fn run_blend(services: &Services, activity: &Activity) -> Result<BlendOutcome, StageError> {
    let err = |e: &dyn std::fmt::Display| StageError::new("blend", e.to_string());

    let StagePayload::Blend(payload) = &activity.stage else {
        return Err(StageError::new("blend", "not a blend activity"));
    };
    let ctx = &activity.ctx;
    let band = &payload.band;
    let is_quality = band == &ctx.quality_band;

    let nodata: i16 =
        if is_quality { ctx.mask.nodata.min(i16::MAX as u16) as i16 } else { ctx.nodata as i16 };

    for scene in payload.scenes.values() {
        if !scene.ard_files.contains_key(band) {
            return Err(StageError::new("blend", format!("ERROR band {band}")));
        }
    }

    let order = blend_order(&payload.scenes);
    let mut inputs = Vec::with_capacity(order.len());
    let mut grid: Option<Raster> = None;

    for date_ref in &order {
        let scene = &payload.scenes[date_ref];
        let band_key = format!("{}{}/{}", ctx.dirname, scene.date, scene.ard_files[band]);
        let quality_key =
            format!("{}{}/{}", ctx.dirname, scene.date, scene.ard_files[&ctx.quality_band]);

        let band_raster = read_raster(services, ctx, &band_key).await?;
        let quality_raster = read_raster(services, ctx, &quality_key).await?;

        if let Some(first) = &grid {
            if band_raster.buffer.dim() != first.buffer.dim() {
                return Err(StageError::new(
                    "blend",
                    format!("scene {date_ref} does not share the tile grid"),
                ));
            }
        } else {
            grid = Some(band_raster.clone());
        }

        inputs.push(SceneArrays {
            date: scene.date,
            band: band_raster.to_i16(),
            quality: quality_raster.to_u16(),
        });
    }

    let grid = grid.ok_or_else(|| StageError::new("blend", "no scenes to blend"))?;
    let outputs = composite(&inputs, &ctx.mask, nodata);

    let quality_stats =
        is_quality.then(|| qa_statistics(outputs.stack.mapv(|v| v.max(0) as u16).view(), &ctx.mask));

    for (func, path) in &payload.composites {
        let raster = match payload.internal_band.as_deref() {
            Some("CLEAROB") => Raster {
                buffer: Buffer::U8(outputs.clearob.clone()),
                transform: grid.transform,
                crs: grid.crs.clone(),
                nodata: None,
            },
            Some("TOTALOB") => Raster {
                buffer: Buffer::U8(outputs.totalob.clone()),
                transform: grid.transform,
                crs: grid.crs.clone(),
                nodata: None,
            },
            Some("PROVENANCE") => Raster {
                buffer: Buffer::I16(outputs.provenance.clone()),
                transform: grid.transform,
                crs: grid.crs.clone(),
                nodata: None,
            },
            Some(other) => {
                return Err(StageError::new("blend", format!("unknown internal band {other}")));
            }
            None => {
                let source = match func {
                    CompositeFunction::Stk => &outputs.stack,
                    CompositeFunction::Med => &outputs.median,
                    CompositeFunction::Idt => continue,
                };
                if is_quality {
                    Raster {
                        buffer: Buffer::U8(source.mapv(|v| v.clamp(0, 255) as u8)),
                        transform: grid.transform,
                        crs: grid.crs.clone(),
                        nodata: Some(f64::from(ctx.mask.nodata)),
                    }
                } else {
                    Raster {
                        buffer: Buffer::I16(source.clone()),
                        transform: grid.transform,
                        crs: grid.crs.clone(),
                        nodata: Some(f64::from(nodata)),
                    }
                }
            }
        };

        let bytes = cog::encode(&raster).map_err(|e| err(&e))?;
        services
            .storage
            .put(&ctx.bucket, path, bytes, false)
            .await
            .map_err(|e| err(&e))?;
    }

    Ok(BlendOutcome { quality_stats })
}

async fn read_raster(
    services: &Services,
    ctx: &CubeContext,
    key: &str,
) -> Result<Raster, StageError> {
    let bytes = services
        .storage
        .get(&ctx.bucket, key)
        .await
        .map_err(|_| StageError::new("blend", format!("ERROR {}", key_basename(key))))?;
    cog::decode(&bytes)
        .map_err(|_| StageError::new("blend", format!("ERROR {}", key_basename(key))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::tests::sample_context;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fmask() -> MaskDescriptor {
        MaskDescriptor {
            nodata: 255,
            clear_data: vec![0, 1],
            not_clear_data: vec![2, 3, 4],
            saturated_data: vec![],
        }
    }

    fn scene(date: NaiveDate, band: Array2<i16>, quality: Array2<u16>) -> SceneArrays {
        SceneArrays { date, band, quality }
    }

    const ND: i16 = -9999;

    /// Three dates, two fully clear and one fully cloudy.
    fn three_date_stack() -> Vec<SceneArrays> {
        let clear = Array2::from_elem((2, 2), 1u16);
        let cloudy = Array2::from_elem((2, 2), 4u16);
        vec![
            scene(date(2024, 1, 1), Array2::from_elem((2, 2), 100), clear.clone()),
            scene(date(2024, 1, 17), Array2::from_elem((2, 2), 200), clear),
            scene(date(2024, 2, 2), Array2::from_elem((2, 2), 300), cloudy),
        ]
    }

    #[test]
    fn best_pixel_takes_first_clear_observation() {
        let outputs = composite(&three_date_stack(), &fmask(), ND);

        // First (highest-priority) clear scene wins everywhere.
        assert!(outputs.stack.iter().all(|&v| v == 100));
        // Day-of-year of January 1st.
        assert!(outputs.provenance.iter().all(|&v| v == 1));
        // Two clear observations, three valid ones.
        assert!(outputs.clearob.iter().all(|&v| v == 2));
        assert!(outputs.totalob.iter().all(|&v| v == 3));
        // Median of the two clear dates.
        assert!(outputs.median.iter().all(|&v| v == 150));
    }

    #[test]
    fn cloudy_pixels_gap_fill_but_stay_not_done() {
        let cloudy = Array2::from_elem((1, 1), 4u16);
        let scenes = vec![
            scene(date(2024, 1, 1), Array2::from_elem((1, 1), 700), cloudy.clone()),
            scene(date(2024, 1, 17), Array2::from_elem((1, 1), 800), cloudy),
        ];
        let outputs = composite(&scenes, &fmask(), ND);

        // No clear observation: the stack keeps the first valid value.
        assert_eq!(outputs.stack[[0, 0]], 700);
        assert_eq!(outputs.provenance[[0, 0]], 1);
        assert_eq!(outputs.clearob[[0, 0]], 0);
        assert_eq!(outputs.totalob[[0, 0]], 2);
        // The median has nothing clear to stand on.
        assert_eq!(outputs.median[[0, 0]], ND);
    }

    #[test]
    fn nodata_pixels_stay_nodata_everywhere() {
        let scenes = vec![scene(
            date(2024, 1, 1),
            Array2::from_elem((1, 2), ND),
            Array2::from_elem((1, 2), 255u16),
        )];
        let outputs = composite(&scenes, &fmask(), ND);

        assert_eq!(outputs.stack[[0, 0]], ND);
        assert_eq!(outputs.median[[0, 0]], ND);
        assert_eq!(outputs.provenance[[0, 0]], -1);
        assert_eq!(outputs.clearob[[0, 0]], 0);
        assert_eq!(outputs.totalob[[0, 0]], 0);
    }

    #[test]
    fn composite_is_deterministic() {
        let a = composite(&three_date_stack(), &fmask(), ND);
        let b = composite(&three_date_stack(), &fmask(), ND);
        assert_eq!(a.stack, b.stack);
        assert_eq!(a.median, b.median);
        assert_eq!(a.provenance, b.provenance);
        assert_eq!(a.clearob, b.clearob);
        assert_eq!(a.totalob, b.totalob);
    }

    fn scene_ref(date_key: &str, efficacy: f64) -> (String, SceneRef) {
        (
            date_key.to_string(),
            SceneRef {
                date: date_key.parse().unwrap(),
                dataset: "landsat-8-l2".to_string(),
                efficacy,
                cloudratio: 100.0 - efficacy,
                ard_files: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn order_is_efficacy_descending_then_date_ascending() {
        let scenes = BTreeMap::from([
            scene_ref("2024-01-17", 90.0),
            scene_ref("2024-01-01", 90.0),
            scene_ref("2024-02-02", 10.0),
            scene_ref("2024-01-09", 95.0),
        ]);

        assert_eq!(
            blend_order(&scenes),
            vec!["2024-01-09", "2024-01-01", "2024-01-17", "2024-02-02"]
        );
    }

    #[test]
    fn composite_paths_follow_the_layout() {
        let ctx = sample_context();
        let path = composite_path(
            &ctx.datacube,
            CompositeFunction::Stk,
            &ctx.version,
            &ctx.tileid,
            ctx.start,
            ctx.end,
            "B4",
        );
        assert_eq!(
            path,
            "LC8_30_STK/001/089098/2024-01-01_2024-01-16/LC8_30_STK_001_089098_2024-01-01_2024-01-16_B4.tif"
        );
        assert_eq!(
            replace_band_suffix(&path, "CLEAROB"),
            "LC8_30_STK/001/089098/2024-01-01_2024-01-16/LC8_30_STK_001_089098_2024-01-01_2024-01-16_CLEAROB.tif"
        );
    }

    #[test]
    fn slot_outputs_respect_function_rules() {
        let ctx = sample_context();

        // Regular band: STK and MED.
        let band = composites_for_slot(&ctx, "B4", false);
        assert_eq!(band.len(), 2);
        assert!(band.contains_key(&CompositeFunction::Stk));
        assert!(band.contains_key(&CompositeFunction::Med));

        // Quality band: STK only.
        let quality = composites_for_slot(&ctx, &ctx.quality_band.clone(), false);
        assert_eq!(quality.keys().collect::<Vec<_>>(), vec![&CompositeFunction::Stk]);

        // PROVENANCE: STK only; CLEAROB: every non-identity function.
        let provenance = composites_for_slot(&ctx, "PROVENANCE", true);
        assert_eq!(provenance.keys().collect::<Vec<_>>(), vec![&CompositeFunction::Stk]);
        let clearob = composites_for_slot(&ctx, "CLEAROB", true);
        assert_eq!(clearob.len(), 2);
        assert!(clearob[&CompositeFunction::Med].ends_with("_CLEAROB.tif"));
    }
}
