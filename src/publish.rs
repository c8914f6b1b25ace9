//! PUBLISH: quicklook rendering and catalog registration for the regular
//! composites and the per-date identity scenes.

use std::collections::BTreeMap;

use crate::blend::{composites_for_slot, replace_band_suffix};
use crate::catalog_db::{APPLICATION_ID, SRID_GRID};
use crate::dispatcher::{commit_activity, next_step};
use crate::models::activity::{encode_key, now_stamp};
use crate::models::catalog::ItemDraft;
use crate::models::{
    Activity, ActivityStatus, CompositeFunction, CubeContext, PublishPayload, PublishScene,
    StageError, StagePayload,
};
use crate::raster::asset::create_asset_definition;
use crate::raster::{cog, quicklook, Raster, COG_MIME_TYPE};
use crate::queue::ActivityQueue;
use crate::services::Services;
use crate::storage::ObjectStore;

/// Assemble the single publish activity of a `(tile, period)` from the
/// completed blend set.
pub async fn next_publish(services: &Services, activity: &Activity) -> anyhow::Result<()> {
    let ctx = &activity.ctx;
    let start = ctx.start.to_string();
    let end = ctx.end.to_string();
    let blend_key = encode_key(&["blend", &ctx.datacube, &ctx.tileid, &start, &end]);
    let publish_key = encode_key(&["publish", &ctx.datacube, &ctx.tileid, &start, &end]);

    let blend_rows = services.tracking.activities_by_key(&blend_key)?;

    let mut scenes: BTreeMap<String, PublishScene> = BTreeMap::new();
    let mut blended: BTreeMap<String, BTreeMap<CompositeFunction, String>> = BTreeMap::new();

    for row in &blend_rows {
        if !ctx.bands.contains(&row.sk) {
            continue;
        }
        let StagePayload::Blend(payload) = &row.activity.stage else { continue };

        for (date_ref, scene) in &payload.scenes {
            let entry = scenes.entry(date_ref.clone()).or_insert_with(|| {
                let mut ard_files = BTreeMap::new();
                if let Some(quality_file) = scene.ard_files.get(&ctx.quality_band) {
                    ard_files.insert(ctx.quality_band.clone(), quality_file.clone());
                    // Per-date index rasters share the scene's naming scheme.
                    if !ctx.indexes_only_regular_cube {
                        for index_name in ctx.bands_expressions.keys() {
                            ard_files.insert(
                                index_name.clone(),
                                replace_band_suffix(quality_file, index_name),
                            );
                        }
                    }
                }
                PublishScene { date: scene.date, cloudratio: scene.cloudratio, ard_files }
            });
            if let Some(file) = scene.ard_files.get(&row.sk) {
                entry.ard_files.insert(row.sk.clone(), file.clone());
            }
        }

        blended.insert(row.sk.clone(), payload.composites.clone());
    }

    // Internal bands and indexes publish the composite outputs the blend and
    // posblend workers derived from the band layouts.
    for internal in &ctx.internal_bands {
        blended.insert(internal.clone(), composites_for_slot(ctx, internal, true));
    }
    for index_name in ctx.bands_expressions.keys() {
        blended.insert(index_name.clone(), composites_for_slot(ctx, index_name, false));
    }

    services.tracking.put_control(&publish_key, 0, 1, &now_stamp())?;

    // The period's cloud cover is the one the quality-band blend measured.
    let (efficacy, cloudratio) = blend_rows
        .iter()
        .find(|row| row.sk == ctx.quality_band)
        .map(|row| (row.efficacy, row.cloudratio))
        .unwrap_or((activity.efficacy, activity.cloudratio));

    let publish_activity = Activity {
        dynamo_key: publish_key.clone(),
        sk: "ALLBANDS".to_string(),
        mystatus: ActivityStatus::NotDone,
        mylaunch: Some(now_stamp()),
        mystart: None,
        myend: None,
        efficacy,
        cloudratio,
        errors: None,
        ctx: ctx.clone(),
        stage: StagePayload::Publish(PublishPayload {
            scenes,
            blended,
            total_instances_to_be_done: 1,
        }),
    };

    if let Some(existing) = services.tracking.get_activity(&publish_key, "ALLBANDS")? {
        if !ctx.force && existing.status == ActivityStatus::Done {
            next_step(services, &publish_activity).await?;
            return Ok(());
        }
        services.tracking.remove_activity(&publish_key, "ALLBANDS")?;
    }

    services.tracking.put_activity(&publish_activity)?;
    services.queue.send(&publish_activity).await?;
    Ok(())
}

// ── Worker ──

/// Render quicklooks and register the catalog items of one `(tile, period)`.
pub async fn publish(services: &Services, mut activity: Activity) -> Activity {
    activity.mystart = Some(now_stamp());

    match run_publish(services, &activity).await {
        Ok(()) => {
            activity.mystatus = ActivityStatus::Done;
            activity.myend = Some(now_stamp());
        }
        Err(e) => activity.mark_error("publish", e.message),
    }

    if let Err(e) = commit_activity(services, &activity).await {
        tracing::error!("publish {}: tracking update failed: {e}", activity.dynamo_key);
    }
    activity
}

async fn run_publish(services: &Services, activity: &Activity) -> Result<(), StageError> {
    let err = |e: &dyn std::fmt::Display| StageError::new("publish", e.to_string());

    let StagePayload::Publish(payload) = &activity.stage else {
        return Err(StageError::new("publish", "not a publish activity"));
    };
    let ctx = &activity.ctx;
    let version: i64 = ctx
        .version
        .parse()
        .map_err(|_| StageError::new("publish", format!("bad version {}", ctx.version)))?;

    let mut drafts: Vec<ItemDraft> = Vec::new();

    // Regular cube: one item per composite function.
    for func in &ctx.functions {
        if *func == CompositeFunction::Idt {
            continue;
        }
        let collection_name = format!("{}_{func}", ctx.datacube);
        let collection = services
            .catalog
            .get_collection(&collection_name, version)
            .map_err(|e| err(&e))?
            .ok_or_else(|| {
                StageError::new(
                    "publish",
                    format!("cube {collection_name} - {version} not found"),
                )
            })?;
        let tile = services
            .catalog
            .get_tile(collection.grid_ref_sys_id, &ctx.tileid)
            .map_err(|e| err(&e))?
            .ok_or_else(|| {
                StageError::new("publish", format!("tile {} not found", ctx.tileid))
            })?;

        let item_name = format!(
            "{collection_name}_{}_{}_{}_{}",
            ctx.version, ctx.tileid, ctx.start, ctx.end
        );

        // Quicklook out of the three configured RGB bands.
        let mut ql_bands = Vec::new();
        for band in &ctx.quicklook {
            let path = payload
                .blended
                .get(band)
                .and_then(|funcs| funcs.get(func))
                .ok_or_else(|| {
                    StageError::new("publish", format!("no {func} output for band {band}"))
                })?;
            ql_bands.push(read_raster(services, ctx, path).await?.to_i16());
        }
        let image = quicklook::render(&ql_bands[0], &ql_bands[1], &ql_bands[2], ctx.nodata as i16)
            .map_err(|e| err(&e))?;
        let png = quicklook::encode_png(&image).map_err(|e| err(&e))?;

        let dirname_ql =
            ctx.dirname.replace(&format!("{}/", ctx.irregular_datacube), &format!("{collection_name}/"));
        let png_key = format!("{dirname_ql}{}_{}/{item_name}.png", ctx.start, ctx.end);
        services
            .storage
            .put(&ctx.bucket, &png_key, png, true)
            .await
            .map_err(|e| err(&e))?;

        let (thumbnail, _, _) = create_asset_definition(
            &format!("{}/{png_key}", ctx.bucket),
            "image/png",
            &["thumbnail"],
            None,
        );
        let mut assets = serde_json::Map::new();
        assets.insert("thumbnail".to_string(), thumbnail);

        let bands_by_cube =
            services.catalog.bands_by_collection(collection.id).map_err(|e| err(&e))?;

        let mut geom = serde_json::Value::Null;
        let mut hull = serde_json::Value::Null;
        let index_names: Vec<String> = ctx.bands_expressions.keys().cloned().collect();
        for band in ctx.bands.iter().chain(ctx.internal_bands.iter()).chain(index_names.iter()) {
            let Some(path) = payload.blended.get(band).and_then(|funcs| funcs.get(func)) else {
                continue;
            };
            let band_model = bands_by_cube
                .iter()
                .find(|b| b.name == *band)
                .ok_or_else(|| StageError::new("publish", format!("band {band} not found")))?;
            let raster = read_raster(services, ctx, path).await?;
            let (asset, asset_geom, asset_hull) = create_asset_definition(
                &format!("{}/{path}", ctx.bucket),
                COG_MIME_TYPE,
                &["data"],
                Some(&raster),
            );
            assets.insert(band_model.name.clone(), asset);
            if let Some(g) = asset_geom {
                geom = g;
            }
            if let Some(h) = asset_hull {
                hull = h;
            }
        }

        drafts.push(ItemDraft {
            collection_id: collection.id,
            tile_id: tile.id,
            name: item_name,
            start_date: ctx.start.to_string(),
            end_date: ctx.end.to_string(),
            cloud_cover: activity.cloudratio,
            assets: serde_json::Value::Object(assets),
            geom,
            min_convex_hull: hull,
            srid: SRID_GRID,
            application_id: APPLICATION_ID,
        });
    }

    // Irregular cube: one item per acquisition date.
    let identity_collection = services
        .catalog
        .get_collection(&ctx.irregular_datacube, version)
        .map_err(|e| err(&e))?
        .ok_or_else(|| {
            StageError::new(
                "publish",
                format!("cube {} - {version} not found", ctx.irregular_datacube),
            )
        })?;
    let identity_tile = services
        .catalog
        .get_tile(identity_collection.grid_ref_sys_id, &ctx.tileid)
        .map_err(|e| err(&e))?
        .ok_or_else(|| StageError::new("publish", format!("tile {} not found", ctx.tileid)))?;

    for scene in payload.scenes.values() {
        let item_name =
            format!("{}_{}_{}_{}", ctx.irregular_datacube, ctx.version, ctx.tileid, scene.date);

        let mut ql_bands = Vec::new();
        for band in &ctx.quicklook {
            let file = scene.ard_files.get(band).ok_or_else(|| {
                StageError::new("publish", format!("band {band} not in scene files"))
            })?;
            let path = format!("{}{}/{file}", ctx.dirname, scene.date);
            ql_bands.push(read_raster(services, ctx, &path).await?.to_i16());
        }
        let image = quicklook::render(&ql_bands[0], &ql_bands[1], &ql_bands[2], ctx.nodata as i16)
            .map_err(|e| err(&e))?;
        let png = quicklook::encode_png(&image).map_err(|e| err(&e))?;
        let png_key = format!("{}{}/{item_name}.png", ctx.dirname, scene.date);
        services
            .storage
            .put(&ctx.bucket, &png_key, png, true)
            .await
            .map_err(|e| err(&e))?;

        let (thumbnail, _, _) = create_asset_definition(
            &format!("{}/{png_key}", ctx.bucket),
            "image/png",
            &["thumbnail"],
            None,
        );
        let mut assets = serde_json::Map::new();
        assets.insert("thumbnail".to_string(), thumbnail);

        let index_names: Vec<String> = if ctx.indexes_only_regular_cube {
            Vec::new()
        } else {
            ctx.bands_expressions.keys().cloned().collect()
        };

        let identity_bands = services
            .catalog
            .bands_by_collection(identity_collection.id)
            .map_err(|e| err(&e))?;

        let mut geom = serde_json::Value::Null;
        let mut hull = serde_json::Value::Null;
        for band in ctx.bands.iter().chain(index_names.iter()) {
            let file = scene.ard_files.get(band).ok_or_else(|| {
                StageError::new("publish", format!("band {band} not in scene files"))
            })?;
            let band_model = identity_bands
                .iter()
                .find(|b| b.name == *band)
                .ok_or_else(|| StageError::new("publish", format!("band {band} not found")))?;
            let path = format!("{}{}/{file}", ctx.dirname, scene.date);
            let raster = read_raster(services, ctx, &path).await?;
            let (asset, asset_geom, asset_hull) = create_asset_definition(
                &format!("{}/{path}", ctx.bucket),
                COG_MIME_TYPE,
                &["data"],
                Some(&raster),
            );
            assets.insert(band_model.name.clone(), asset);
            if let Some(g) = asset_geom {
                geom = g;
            }
            if let Some(h) = asset_hull {
                hull = h;
            }
        }

        drafts.push(ItemDraft {
            collection_id: identity_collection.id,
            tile_id: identity_tile.id,
            name: item_name,
            start_date: scene.date.to_string(),
            end_date: scene.date.to_string(),
            cloud_cover: scene.cloudratio,
            assets: serde_json::Value::Object(assets),
            geom,
            min_convex_hull: hull,
            srid: SRID_GRID,
            application_id: APPLICATION_ID,
        });
    }

    services.catalog.commit_items(&drafts).map_err(|e| err(&e))?;
    Ok(())
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
        .map_err(|e| StageError::new("publish", e.to_string()))?;
    cog::decode(&bytes).map_err(|e| StageError::new("publish", e.to_string()))
}
