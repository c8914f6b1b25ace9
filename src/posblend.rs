//! POSBLEND: spectral-index evaluation over composites and, for irregular
//! cubes, over every per-date merge output.

use std::collections::BTreeMap;

use crate::dispatcher::{commit_activity, next_step};
use crate::models::activity::{encode_key, now_stamp};
use crate::models::{
    Activity, ActivityStatus, CompositeFunction, CubeContext, IndexInputs, IndexTarget,
    PosblendPayload, StageError, StagePayload,
};
use crate::raster::{algebra, cog, Buffer, Raster};
use crate::queue::ActivityQueue;
use crate::services::Services;
use crate::storage::ObjectStore;
use crate::blend::replace_band_suffix;

/// Resolve the band names an expression reads, through the cube's band-id map.
fn expression_bands(ctx: &CubeContext, index_name: &str) -> anyhow::Result<Vec<String>> {
    let expr = ctx
        .bands_expressions
        .get(index_name)
        .ok_or_else(|| anyhow::anyhow!("unknown index {index_name}"))?;
    let mut names = Vec::new();
    for id in &expr.band_ids {
        let name = ctx
            .band_ids
            .get(&id.to_string())
            .ok_or_else(|| anyhow::anyhow!("index {index_name} references unknown band id {id}"))?;
        names.push(name.clone());
    }
    Ok(names)
}

/// Fan out one posblend activity per index — and per date for irregular
/// cubes — once every blend of the `(tile, period)` finished.
pub async fn next_posblend(services: &Services, blend_activity: &Activity) -> anyhow::Result<()> {
    let StagePayload::Blend(blend_payload) = &blend_activity.stage else {
        anyhow::bail!("next_posblend requires a blend activity");
    };
    let ctx = &blend_activity.ctx;
    let start = ctx.start.to_string();
    let end = ctx.end.to_string();
    let blend_key = encode_key(&["blend", &ctx.datacube, &ctx.tileid, &start, &end]);
    let posblend_key = encode_key(&["posblend", &ctx.datacube, &ctx.tileid, &start, &end]);

    let scene_count = blend_payload.scenes.len() as u64;
    let quantity = if ctx.indexes_only_regular_cube { 1 } else { scene_count + 1 };
    let total = ctx.bands_expressions.len() as u64 * quantity;
    services.tracking.put_control(&posblend_key, 0, total as i64, &now_stamp())?;

    for index_name in ctx.bands_expressions.keys() {
        let band_names = expression_bands(ctx, index_name)?;

        let mut inputs = IndexInputs::default();
        for band_name in &band_names {
            let Some(row) = services.tracking.get_activity(&blend_key, band_name)? else {
                anyhow::bail!("blend row for band {band_name} is missing");
            };
            let StagePayload::Blend(band_blend) = &row.activity.stage else { continue };

            for (func, path) in &band_blend.composites {
                inputs
                    .composite
                    .entry(*func)
                    .or_default()
                    .insert(band_name.clone(), path.clone());
            }

            if !ctx.indexes_only_regular_cube {
                for scene in band_blend.scenes.values() {
                    let Some(file) = scene.ard_files.get(band_name) else { continue };
                    inputs
                        .identity
                        .entry(scene.date.to_string())
                        .or_default()
                        .insert(
                            band_name.clone(),
                            format!("{}{}/{}", ctx.dirname, scene.date, file),
                        );
                }
            }
        }

        let mut targets = vec![(index_name.clone(), IndexTarget::Composite)];
        if !ctx.indexes_only_regular_cube {
            for scene in blend_payload.scenes.values() {
                targets.push((
                    format!("{index_name}IDT{}", scene.date),
                    IndexTarget::Identity { date: scene.date },
                ));
            }
        }

        for (sk, target) in targets {
            let activity = Activity {
                dynamo_key: posblend_key.clone(),
                sk: sk.clone(),
                mystatus: ActivityStatus::NotDone,
                mylaunch: Some(now_stamp()),
                mystart: None,
                myend: None,
                efficacy: 0.0,
                cloudratio: 100.0,
                errors: None,
                ctx: ctx.clone(),
                stage: StagePayload::Posblend(PosblendPayload {
                    index_name: index_name.clone(),
                    target,
                    inputs: inputs.clone(),
                    scenes: blend_payload.scenes.clone(),
                    total_instances_to_be_done: total,
                }),
            };

            if let Some(existing) = services.tracking.get_activity(&posblend_key, &sk)? {
                if !ctx.force && existing.status == ActivityStatus::Done {
                    next_step(services, &activity).await?;
                    continue;
                }
                services.tracking.remove_activity(&posblend_key, &sk)?;
            }

            services.tracking.put_activity(&activity)?;
            services.queue.send(&activity).await?;
        }
    }

    Ok(())
}

// ── Worker ──

/// Evaluate one index over its target rasters.
pub async fn posblend(services: &Services, mut activity: Activity) -> Activity {
    activity.mystart = Some(now_stamp());

    match run_posblend(services, &activity).await {
        Ok(()) => {
            activity.mystatus = ActivityStatus::Done;
            activity.myend = Some(now_stamp());
        }
        Err(e) => activity.mark_error("posblend", e.message),
    }

    if let Err(e) = commit_activity(services, &activity).await {
        tracing::error!("posblend {}: tracking update failed: {e}", activity.dynamo_key);
    }
    activity
}

async fn run_posblend(services: &Services, activity: &Activity) -> Result<(), StageError> {
    let StagePayload::Posblend(payload) = &activity.stage else {
        return Err(StageError::new("posblend", "not a posblend activity"));
    };
    let ctx = &activity.ctx;

    let expression = ctx
        .bands_expressions
        .get(&payload.index_name)
        .ok_or_else(|| {
            StageError::new("posblend", format!("unknown index {}", payload.index_name))
        })?
        .expression
        .clone();

    match &payload.target {
        IndexTarget::Composite => {
            for func in &ctx.functions {
                if *func == CompositeFunction::Idt {
                    continue;
                }
                let Some(bands) = payload.inputs.composite.get(func) else { continue };
                create_index(services, ctx, &payload.index_name, &expression, bands).await?;
            }
        }
        IndexTarget::Identity { date } => {
            let bands = payload.inputs.identity.get(&date.to_string()).ok_or_else(|| {
                StageError::new("posblend", format!("no identity inputs for {date}"))
            })?;
            create_index(services, ctx, &payload.index_name, &expression, bands).await?;
        }
    }

    Ok(())
}

/// Evaluate `expression` over the given band rasters and write the index
/// raster next to the first input, swapping the band suffix for the index
/// name. Skipped when the output already exists and force is off.
async fn create_index(
    services: &Services,
    ctx: &CubeContext,
    index_name: &str,
    expression: &str,
    band_paths: &BTreeMap<String, String>,
) -> Result<(), StageError> {
    let err = |e: &dyn std::fmt::Display| StageError::new("posblend", e.to_string());

    let (_, first_path) = band_paths
        .iter()
        .next()
        .ok_or_else(|| StageError::new("posblend", format!("index {index_name} has no inputs")))?;
    let out_path = replace_band_suffix(first_path, index_name);

    if !ctx.force && services.storage.head(&ctx.bucket, &out_path).await.map_err(|e| err(&e))? {
        return Ok(());
    }

    let expr = algebra::parse(expression).map_err(|e| err(&e))?;
    let needed = algebra::band_refs(&expr);

    let nodata = f64::from(ctx.nodata as i16);
    let mut bands = BTreeMap::new();
    let mut grid: Option<Raster> = None;

    for band in &needed {
        let path = band_paths.get(band).ok_or_else(|| {
            StageError::new(
                "posblend",
                format!("index {index_name} needs band {band} but no input was mapped"),
            )
        })?;
        let bytes = services.storage.get(&ctx.bucket, path).await.map_err(|e| err(&e))?;
        let raster = cog::decode(&bytes).map_err(|e| err(&e))?;

        let band_nodata = raster.nodata.unwrap_or(nodata);
        let values = raster
            .to_i16()
            .mapv(|v| if f64::from(v) == band_nodata { f64::NAN } else { f64::from(v) });

        if grid.is_none() {
            grid = Some(raster);
        }
        bands.insert(band.clone(), values);
    }

    let grid = grid
        .ok_or_else(|| StageError::new("posblend", format!("index {index_name} reads no bands")))?;
    let shape = (grid.height(), grid.width());

    let evaluated = algebra::evaluate(&expr, &bands, shape).map_err(|e| err(&e))?;
    let out = evaluated.mapv(|v| {
        if v.is_nan() {
            ctx.nodata as i16
        } else {
            v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
        }
    });

    let raster = Raster {
        buffer: Buffer::I16(out),
        transform: grid.transform,
        crs: grid.crs.clone(),
        nodata: Some(f64::from(ctx.nodata as i16)),
    };
    let bytes = cog::encode(&raster).map_err(|e| err(&e))?;
    services
        .storage
        .put(&ctx.bucket, &out_path, bytes, false)
        .await
        .map_err(|e| err(&e))?;

    Ok(())
}
