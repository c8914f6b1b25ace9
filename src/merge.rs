//! MERGE: fan-out preparation and the per-date warp/compose worker.

use chrono::NaiveDate;
use ndarray::Array2;

use crate::dispatcher::{commit_activity, next_step};
use crate::models::activity::{encode_key, now_stamp, stage_control_keys};
use crate::models::{
    Activity, ActivityStatus, CubeContext, CubeDescriptor, MergePayload, StageError, StagePayload,
    INTERNAL_BANDS,
};
use crate::orchestrator::ItemSkeleton;
use crate::raster::quality::{classify, qa_statistics};
use crate::raster::warp::{reproject, Resampling};
use crate::raster::{cog, Buffer, GeoTransform, Raster};
use crate::queue::ActivityQueue;
use crate::services::Services;
use crate::storage::ObjectStore;

/// Enumerate and enqueue the merge activities of every `(tile, period)`.
///
/// Returns the `(tile, period)` keys skipped because they were already
/// published (and `force` was not set).
pub async fn prepare_merge(
    services: &Services,
    cube: &CubeDescriptor,
    items: &ItemSkeleton,
    force: bool,
) -> anyhow::Result<Vec<String>> {
    let version = cube.formatted_version();
    let irregular = cube.irregular_name();
    let mut skipped = Vec::new();

    for (tile_name, tile) in items {
        for (period_key, item) in &tile.periods {
            let start = item.composite_start;
            let end = item.composite_end;

            let [merge_key, blend_key, posblend_key, publish_key] =
                stage_control_keys(&cube.name, &irregular, tile_name, start, end);

            if !force {
                let published = services.tracking.get_activity(&publish_key, "ALLBANDS")?;
                if published.is_some_and(|row| row.status == ActivityStatus::Done) {
                    skipped.push(format!("{tile_name}_{start}_{end}"));
                    continue;
                }
            } else {
                for key in [&merge_key, &blend_key, &posblend_key, &publish_key] {
                    services.tracking.remove_control(key)?;
                    services.tracking.remove_activities_by_key(key)?;
                }
            }

            let scenes = services
                .stac
                .search_scenes(&tile.geom, start, end, &cube.datasets, &cube.bands)
                .await?;

            // Dates come from the first band carrying scenes; every band is
            // expected to share the same acquisition set.
            let mut list_dates: Vec<NaiveDate> = Vec::new();
            if let Some((_, datasets)) = scenes.iter().next() {
                for dates in datasets.values() {
                    for date in dates.keys() {
                        if let Ok(parsed) = date.parse() {
                            list_dates.push(parsed);
                        }
                    }
                }
            }

            let instances = list_dates.len() as u64;
            let total = instances * cube.bands.len() as u64;
            services.tracking.put_control(&merge_key, 0, total as i64, &now_stamp())?;

            let ctx = CubeContext {
                datacube: cube.name.clone(),
                irregular_datacube: irregular.clone(),
                version: version.clone(),
                satellite: cube.satellite.to_uppercase(),
                datasets: cube.datasets.clone(),
                tileid: tile_name.clone(),
                start,
                end,
                dirname: item.dirname.clone(),
                bands: cube.bands.clone(),
                band_ids: cube.band_ids.clone(),
                quality_band: cube.quality_band.clone(),
                quicklook: cube.quicklook.to_vec(),
                nodata: cube.nodata,
                srs: cube.crs.clone(),
                resx: cube.resx,
                resy: cube.resy,
                functions: cube.functions.clone(),
                internal_bands: INTERNAL_BANDS.iter().map(|b| b.to_string()).collect(),
                bands_expressions: cube.bands_expressions.clone(),
                mask: cube.mask.clone(),
                indexes_only_regular_cube: cube.indexes_only_regular_cube,
                force,
                shape: item.shape,
                geom: tile.geom.clone(),
                xmin: tile.xmin,
                ymax: tile.ymax,
                dist_x: tile.dist_x,
                dist_y: tile.dist_y,
                bucket: services.bucket.clone(),
            };

            if instances == 0 {
                let mut activity = Activity {
                    dynamo_key: merge_key.clone(),
                    sk: "NOSCENES".to_string(),
                    mystatus: ActivityStatus::Error,
                    mylaunch: Some(now_stamp()),
                    mystart: None,
                    myend: None,
                    efficacy: 0.0,
                    cloudratio: 100.0,
                    errors: None,
                    ctx,
                    stage: StagePayload::Merge(MergePayload {
                        band: String::new(),
                        dataset: String::new(),
                        date: start,
                        links: Vec::new(),
                        source_nodata: None,
                        ard_file: String::new(),
                        list_dates: Vec::new(),
                        instances_to_be_done: 0,
                        total_instances_to_be_done: 0,
                    }),
                };
                activity.errors = Some(StageError::new(
                    "prepare_merge",
                    format!("no scenes found for {tile_name} {period_key}"),
                ));
                commit_activity(services, &activity).await?;
                continue;
            }

            for (band, datasets) in &scenes {
                for (dataset, dates) in datasets {
                    for (date_key, links) in dates {
                        let Ok(date) = date_key.parse::<NaiveDate>() else { continue };
                        let ard_file = format!(
                            "{}{date}/{}_{version}_{}_{date}_{band}.tif",
                            item.dirname, irregular, tile_name
                        );
                        let dynamo_key = encode_key(&[
                            "merge",
                            &irregular,
                            tile_name,
                            date_key,
                            band,
                        ]);

                        let activity = Activity {
                            dynamo_key: dynamo_key.clone(),
                            sk: date_key.clone(),
                            mystatus: ActivityStatus::NotDone,
                            mylaunch: Some(now_stamp()),
                            mystart: None,
                            myend: None,
                            efficacy: 0.0,
                            cloudratio: 100.0,
                            errors: None,
                            ctx: ctx.clone(),
                            stage: StagePayload::Merge(MergePayload {
                                band: band.clone(),
                                dataset: dataset.clone(),
                                date,
                                links: links.iter().map(|l| l.link.clone()).collect(),
                                source_nodata: links.iter().find_map(|l| l.source_nodata),
                                ard_file: ard_file.clone(),
                                list_dates: list_dates.clone(),
                                instances_to_be_done: instances,
                                total_instances_to_be_done: total,
                            }),
                        };

                        if let Some(existing) = services.tracking.get_activity(&dynamo_key, date_key)? {
                            let output_exists =
                                services.storage.head(&ctx.bucket, &ard_file).await?;
                            if !force && existing.status == ActivityStatus::Done && output_exists {
                                // Already merged in a previous run; report
                                // completion so the counter still fills up.
                                next_step(services, &activity).await?;
                                continue;
                            }
                            services.tracking.remove_activity(&dynamo_key, date_key)?;
                        }

                        services.tracking.put_activity(&activity)?;
                        services.queue.send(&activity).await?;
                    }
                }
            }
        }
    }

    Ok(skipped)
}

// ── Worker ──

pub(crate) struct TargetGrid {
    pub cols: usize,
    pub rows: usize,
    /// North-up transform; absent in shape mode, where the source grid wins.
    pub transform: Option<GeoTransform>,
    pub new_res: Option<(f64, f64)>,
}

/// Pixel grid of the merge target. Without an explicit shape the tile extent
/// is divided into whole pixels and the residual folded into the resolution.
pub(crate) fn target_grid(ctx: &CubeContext) -> TargetGrid {
    if let Some((cols, rows)) = ctx.shape {
        return TargetGrid { cols, rows, transform: None, new_res: None };
    }

    let cols = (ctx.dist_x / ctx.resx).round() as usize;
    let rows = (ctx.dist_y / ctx.resy).round() as usize;
    let new_res_x = ctx.dist_x / cols as f64;
    let new_res_y = ctx.dist_y / rows as f64;

    TargetGrid {
        cols,
        rows,
        transform: Some(GeoTransform {
            res_x: new_res_x,
            res_y: new_res_y,
            x_min: ctx.xmin,
            y_max: ctx.ymax,
        }),
        new_res: Some((new_res_x, new_res_y)),
    }
}

/// Valid pixels of `scene` overwrite the running merge; later scenes win.
pub(crate) fn compose_band(merge: &mut Array2<i16>, scene: &Array2<i16>, nodata: i16) {
    ndarray::Zip::from(merge).and(scene).for_each(|m, &s| {
        if s != nodata {
            *m = s;
        }
    });
}

/// Zero-nodata quality merge: each pixel takes the first scene that carried
/// data there, accumulated through a decaying write mask.
pub(crate) fn compose_quality_sum(
    merge: &mut Array2<u16>,
    write_mask: &mut Array2<u16>,
    scene: &Array2<u16>,
    nodata: u16,
) {
    ndarray::Zip::from(merge)
        .and(write_mask)
        .and(scene)
        .for_each(|m, w, &s| {
            *m += s * *w;
            if s != nodata {
                *w = 0;
            }
        });
}

/// Pick the nodata of one source scene: the source's own declaration wins,
/// then the activity override, then the satellite-family default.
pub(crate) fn source_nodata_for(
    ctx: &CubeContext,
    payload: &MergePayload,
    source: &Raster,
    target_nodata: f64,
) -> f64 {
    if let Some(declared) = source.nodata {
        return declared;
    }
    if let Some(declared) = payload.source_nodata {
        return declared;
    }

    let is_quality = payload.band == ctx.quality_band;
    if is_quality {
        return f64::from(ctx.mask.nodata);
    }
    if ctx.satellite_is("LANDSAT") {
        return match source.buffer {
            Buffer::I16(_) => target_nodata,
            _ => 0.0,
        };
    }
    if ctx.satellite_is("CBERS") {
        return target_nodata;
    }
    0.0
}

struct MergeOutcome {
    efficacy: f64,
    cloudratio: f64,
    new_res: Option<(f64, f64)>,
}

/// Warp the scene assets of one `(tile, period, band, date)` onto the tile
/// grid and compose them into a single ARD raster.
pub async fn merge_warped(services: &Services, mut activity: Activity) -> Activity {
    activity.mystart = Some(now_stamp());

    let result = run_merge(services, &activity).await;
    match result {
        Ok(outcome) => {
            activity.mystatus = ActivityStatus::Done;
            activity.efficacy = outcome.efficacy;
            activity.cloudratio = outcome.cloudratio;
            activity.myend = Some(now_stamp());
            if let Some((res_x, res_y)) = outcome.new_res {
                tracing::info!(
                    "merge {} [{}]: grid resolution {res_x:.4} x {res_y:.4}",
                    activity.dynamo_key,
                    activity.sk
                );
            }
        }
        Err(e) => {
            activity.mark_error("merge", e.message);
        }
    }

    if let Err(e) = commit_activity(services, &activity).await {
        tracing::error!("merge {}: tracking update failed: {e}", activity.dynamo_key);
    }
    activity
}

async fn run_merge(services: &Services, activity: &Activity) -> Result<MergeOutcome, StageError> {
    let err = |e: &dyn std::fmt::Display| StageError::new("merge", e.to_string());

    let StagePayload::Merge(payload) = &activity.stage else {
        return Err(StageError::new("merge", "not a merge activity"));
    };
    let ctx = &activity.ctx;
    let is_quality = payload.band == ctx.quality_band;

    // Skip path: the target already exists and force is off.
    if !ctx.force
        && services
            .storage
            .head(&ctx.bucket, &payload.ard_file)
            .await
            .map_err(|e| err(&e))?
    {
        let bytes = services
            .storage
            .get(&ctx.bucket, &payload.ard_file)
            .await
            .map_err(|e| err(&e))?;
        match cog::decode(&bytes) {
            Ok(existing) => {
                let (efficacy, cloudratio) = if is_quality {
                    qa_statistics(existing.to_u16().view(), &ctx.mask)
                } else {
                    (0.0, 100.0)
                };
                return Ok(MergeOutcome { efficacy, cloudratio, new_res: None });
            }
            Err(e) => {
                // Stale or corrupt object: drop it and rebuild.
                tracing::warn!("merge {}: unreadable target, rebuilding: {e}", payload.ard_file);
                services
                    .storage
                    .delete(&ctx.bucket, &payload.ard_file)
                    .await
                    .map_err(|e| err(&e))?;
            }
        }
    }

    let grid = target_grid(ctx);
    let shape = (grid.rows, grid.cols);
    let band_nodata = ctx.nodata as i16;
    let quality_nodata = ctx.mask.nodata;

    // Sentinel-2 / Landsat quality layers with a nonzero nodata compose like
    // regular bands; zero-nodata masks (CBERS style) sum through a write mask.
    let is_sl_quality = is_quality
        && (ctx.satellite_is("LANDSAT") || ctx.satellite.to_uppercase() == "SENTINEL-2")
        && ctx.mask.nodata != 0;

    let mut quality_merge = Array2::from_elem(shape, quality_nodata);
    let mut quality_write_mask: Array2<u16> = Array2::ones(shape);
    let mut band_merge = Array2::from_elem(shape, band_nodata);

    let mut out_transform = grid.transform;

    for link in &payload.links {
        let bytes = services.storage.get(&ctx.bucket, link).await.map_err(|e| err(&e))?;
        let source = cog::decode(&bytes).map_err(|e| err(&e))?;

        let target_nodata =
            if is_quality { f64::from(quality_nodata) } else { f64::from(band_nodata) };
        let src_nodata = source_nodata_for(ctx, payload, &source, target_nodata);

        if out_transform.is_none() {
            out_transform = Some(source.transform);
        }

        if is_quality {
            let scene = warp_quality(&source, &grid, src_nodata, quality_nodata)
                .map_err(|e| err(&e))?;
            if is_sl_quality {
                compose_band_u16(&mut quality_merge, &scene, quality_nodata);
            } else {
                compose_quality_sum(
                    &mut quality_merge,
                    &mut quality_write_mask,
                    &scene,
                    quality_nodata,
                );
            }
        } else {
            let scene = warp_band(&source, &grid, src_nodata, band_nodata).map_err(|e| err(&e))?;
            compose_band(&mut band_merge, &scene, band_nodata);
        }
    }

    let transform = out_transform
        .ok_or_else(|| StageError::new("merge", "no source scenes delivered a grid"))?;

    let (raster, efficacy, cloudratio) = if is_quality {
        let (classified, efficacy, cloudratio) = classify(&quality_merge, &ctx.mask);
        let raster = Raster {
            buffer: Buffer::U8(classified),
            transform,
            crs: ctx.srs.clone(),
            nodata: Some(f64::from(quality_nodata)),
        };
        (raster, efficacy, cloudratio)
    } else {
        let raster = Raster {
            buffer: Buffer::I16(band_merge),
            transform,
            crs: ctx.srs.clone(),
            nodata: Some(f64::from(band_nodata)),
        };
        (raster, 0.0, 100.0)
    };

    let bytes = cog::encode(&raster).map_err(|e| err(&e))?;
    services
        .storage
        .put(&ctx.bucket, &payload.ard_file, bytes, false)
        .await
        .map_err(|e| err(&e))?;

    Ok(MergeOutcome { efficacy, cloudratio, new_res: grid.new_res })
}

fn warp_band(
    source: &Raster,
    grid: &TargetGrid,
    src_nodata: f64,
    dst_nodata: i16,
) -> anyhow::Result<Array2<i16>> {
    let data = source.to_i16();
    match grid.transform {
        Some(dst_transform) => Ok(reproject(
            data.view(),
            source.transform,
            (grid.rows, grid.cols),
            dst_transform,
            src_nodata as i16,
            dst_nodata,
            Resampling::Bilinear,
        )),
        None => {
            anyhow::ensure!(
                data.dim() == (grid.rows, grid.cols),
                "scene does not match the requested shape"
            );
            Ok(data)
        }
    }
}

fn warp_quality(
    source: &Raster,
    grid: &TargetGrid,
    src_nodata: f64,
    dst_nodata: u16,
) -> anyhow::Result<Array2<u16>> {
    let data = source.to_u16();
    match grid.transform {
        Some(dst_transform) => Ok(reproject(
            data.view(),
            source.transform,
            (grid.rows, grid.cols),
            dst_transform,
            src_nodata as u16,
            dst_nodata,
            Resampling::Nearest,
        )),
        None => {
            anyhow::ensure!(
                data.dim() == (grid.rows, grid.cols),
                "scene does not match the requested shape"
            );
            Ok(data)
        }
    }
}

fn compose_band_u16(merge: &mut Array2<u16>, scene: &Array2<u16>, nodata: u16) {
    ndarray::Zip::from(merge).and(scene).for_each(|m, &s| {
        if s != nodata {
            *m = s;
        }
    });
}
