//! Worker dispatch and the stage-transition machinery.
//!
//! `next_step` performs the atomic counter increment; the completer whose
//! increment lands exactly on the expected total fans out the next stage.
//! The dispatcher drains the activity queue from a background task, one
//! activity at a time, mirroring how queue-triggered workers run one message
//! per invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::models::activity::now_stamp;
use crate::models::{Activity, ActivityStatus, StagePayload};
use crate::services::Services;
use crate::{blend, merge, posblend, publish};

/// Persist an activity row and advance the pipeline according to its status:
/// `DONE` reports completion to the stage counter, `ERROR` bumps the error
/// counter so the stage visibly never completes.
pub async fn commit_activity(services: &Services, activity: &Activity) -> anyhow::Result<()> {
    services.tracking.put_activity(activity)?;
    match activity.mystatus {
        ActivityStatus::Done => next_step(services, activity).await,
        ActivityStatus::Error => services.tracking.increment_errors(&activity.control_key()),
        ActivityStatus::NotDone => Ok(()),
    }
}

/// Re-drive a list of activities after manual repair: rows are re-put, `DONE`
/// ones report to their counters again.
pub async fn solo(services: &Services, activities: &[Activity]) -> anyhow::Result<()> {
    for activity in activities {
        commit_activity(services, activity).await?;
    }
    Ok(())
}

/// Report one completed activity to its stage counter, firing the next
/// stage's fan-out when this was the last completer.
///
/// Boxed because the fan-out path recurses: a fully-cached blend fan-out
/// calls straight back into `next_step`.
pub fn next_step<'a>(
    services: &'a Services,
    activity: &'a Activity,
) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let control_key = activity.control_key();
        let Some((count, total)) = services.tracking.increment_count(&control_key, &now_stamp())?
        else {
            tracing::warn!("no counter row for {control_key}, transition skipped");
            return Ok(());
        };

        if count != total {
            return Ok(());
        }

        tracing::info!("stage {} complete for {control_key}", activity.action());
        match &activity.stage {
            StagePayload::Merge(_) => blend::next_blend(services, activity).await?,
            StagePayload::Blend(_) => {
                if activity.ctx.bands_expressions.is_empty() {
                    publish::next_publish(services, activity).await?;
                } else {
                    posblend::next_posblend(services, activity).await?;
                }
            }
            StagePayload::Posblend(_) => publish::next_publish(services, activity).await?,
            StagePayload::Publish(_) => {}
        }
        Ok(())
    })
}

/// Run one activity through its stage worker, returning the finished row.
pub async fn run_activity(services: &Services, activity: Activity) -> Activity {
    match &activity.stage {
        StagePayload::Merge(_) => merge::merge_warped(services, activity).await,
        StagePayload::Blend(_) => blend::blend(services, activity).await,
        StagePayload::Posblend(_) => posblend::posblend(services, activity).await,
        StagePayload::Publish(_) => publish::publish(services, activity).await,
    }
}

/// Consume the in-process activity queue until it closes. Activities are
/// processed one at a time, matching the one-activity-per-invocation worker
/// model of the distributed deployment.
pub fn spawn_dispatcher(services: Arc<Services>, mut rx: mpsc::UnboundedReceiver<Activity>) {
    tokio::spawn(async move {
        while let Some(activity) = rx.recv().await {
            let key = activity.dynamo_key.clone();
            let sk = activity.sk.clone();
            let finished = run_activity(&services, activity).await;
            match finished.mystatus {
                ActivityStatus::Done => {
                    tracing::info!("{} {key} [{sk}] done", finished.action());
                }
                ActivityStatus::Error => {
                    let message = finished
                        .errors
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string());
                    tracing::error!("{} {key} [{sk}] failed: {message}", finished.action());
                }
                ActivityStatus::NotDone => {
                    tracing::warn!("{} {key} [{sk}] ended without a terminal status", finished.action());
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_db::CatalogDb;
    use crate::models::catalog::TileRow;
    use crate::models::cube::{
        BandExpression, CompositeFunction, CubeDescriptor, CycleSchema, MaskDescriptor,
        TemporalSchema, TimeUnit,
    };
    use crate::orchestrator::{start_cube_build, CubeStartRequest};
    use crate::queue::MemoryQueue;
    use crate::raster::{cog, Buffer, GeoTransform, Raster};
    use crate::services::Services;
    use crate::stac::StacClient;
    use crate::storage::{LocalStore, ObjectStore};
    use crate::tracking_db::TrackingDb;
    use chrono::NaiveDate;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    const TILE_TRANSFORM: GeoTransform =
        GeoTransform { res_x: 30.0, res_y: 30.0, x_min: 0.0, y_max: 60.0 };

    fn cube() -> CubeDescriptor {
        CubeDescriptor {
            name: "LC8_30".to_string(),
            version: 1,
            grid_ref_sys_id: 1,
            datasets: vec!["landsat-8-l2".to_string()],
            satellite: "LANDSAT-8".to_string(),
            bands: vec!["B4".to_string(), "B8".to_string(), "Fmask4".to_string()],
            band_ids: BTreeMap::from([
                ("1".to_string(), "B4".to_string()),
                ("2".to_string(), "B8".to_string()),
            ]),
            quality_band: "Fmask4".to_string(),
            quicklook: ["B4".to_string(), "B8".to_string(), "B4".to_string()],
            nodata: -9999,
            crs: "EPSG:32723".to_string(),
            resx: 30.0,
            resy: 30.0,
            functions: vec![
                CompositeFunction::Idt,
                CompositeFunction::Stk,
                CompositeFunction::Med,
            ],
            bands_expressions: BTreeMap::from([(
                "NDVI".to_string(),
                BandExpression {
                    expression: "10000. * ((B8 - B4) / (B8 + B4))".to_string(),
                    band_ids: vec![2, 1],
                },
            )]),
            mask: MaskDescriptor {
                nodata: 255,
                clear_data: vec![0, 1],
                not_clear_data: vec![2, 3, 4],
                saturated_data: vec![],
            },
            temporal_schema: TemporalSchema {
                step: 16,
                unit: TimeUnit::Day,
                cycle: Some(CycleSchema { step: 1, unit: TimeUnit::Year }),
            },
            indexes_only_regular_cube: false,
        }
    }

    fn band_bytes(value: i16) -> Vec<u8> {
        cog::encode(&Raster {
            buffer: Buffer::I16(Array2::from_elem((2, 2), value)),
            transform: TILE_TRANSFORM,
            crs: "EPSG:32723".to_string(),
            nodata: Some(-9999.0),
        })
        .unwrap()
    }

    fn quality_bytes(value: u8) -> Vec<u8> {
        cog::encode(&Raster {
            buffer: Buffer::U8(Array2::from_elem((2, 2), value)),
            transform: TILE_TRANSFORM,
            crs: "EPSG:32723".to_string(),
            nodata: Some(255.0),
        })
        .unwrap()
    }

    async fn spawn_stac(payload: serde_json::Value) -> String {
        let app = axum::Router::new().route(
            "/search",
            axum::routing::post(move || {
                let payload = payload.clone();
                async move { axum::Json(payload) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn seed_catalog(catalog: &CatalogDb, cube: &CubeDescriptor) {
        catalog.create_grid(1, "BDC_MD").unwrap();
        catalog
            .create_tile(&TileRow {
                id: 10,
                grid_ref_sys_id: 1,
                name: "089098".to_string(),
                geom: serde_json::json!({
                    "type": "Polygon",
                    "coordinates": [[[-46.0, -23.0], [-45.9, -23.0], [-45.9, -22.9], [-46.0, -22.9], [-46.0, -23.0]]]
                }),
                xmin: 0.0,
                ymax: 60.0,
                dist_x: 60.0,
                dist_y: 60.0,
            })
            .unwrap();
        catalog.save_cube(cube).unwrap();

        let composite_bands =
            ["B4", "B8", "Fmask4", "CLEAROB", "TOTALOB", "PROVENANCE", "NDVI"];
        for name in ["LC8_30_STK", "LC8_30_MED"] {
            let id = catalog.create_collection(name, 1, 1).unwrap();
            for band in composite_bands {
                catalog.create_band(id, band, band, "int16").unwrap();
            }
        }
        let idt = catalog.create_collection("LC8_30_IDT", 1, 1).unwrap();
        for band in ["B4", "B8", "Fmask4", "NDVI"] {
            catalog.create_band(idt, band, band, "int16").unwrap();
        }
    }

    /// Three acquisitions in one period: Jan 4 and Jan 8 fully clear, Jan 12
    /// fully cloudy.
    async fn seed_sources(storage: &LocalStore) -> serde_json::Value {
        let scenes = [
            ("LC08_L2SP_220069_20240104_20240110_02_T1", "0104", 100i16, 300i16, 1u8),
            ("LC08_L2SP_220069_20240108_20240114_02_T1", "0108", 200, 200, 0),
            ("LC08_L2SP_220069_20240112_20240118_02_T1", "0112", 250, 260, 4),
        ];

        let mut features = Vec::new();
        for (scene_id, tag, b4, b8, fmask) in scenes {
            for (band, bytes) in [
                ("B4", band_bytes(b4)),
                ("B8", band_bytes(b8)),
                ("Fmask4", quality_bytes(fmask)),
            ] {
                storage
                    .put("cubes", &format!("sources/{tag}_{band}.tif"), bytes, false)
                    .await
                    .unwrap();
            }
            features.push(serde_json::json!({
                "id": scene_id,
                "assets": {
                    "B4": {"href": format!("sources/{tag}_B4.tif")},
                    "B8": {"href": format!("sources/{tag}_B8.tif")},
                    "Fmask4": {"href": format!("sources/{tag}_Fmask4.tif")},
                },
            }));
        }
        serde_json::json!({ "features": features })
    }

    async fn build_services(
        dir: &std::path::Path,
        stac_url: String,
    ) -> (Arc<Services>, mpsc::UnboundedReceiver<Activity>) {
        let (queue, rx) = MemoryQueue::channel();
        let services = Services {
            storage: Arc::new(LocalStore::new(dir.join("data"))),
            queue: Arc::new(queue),
            tracking: Arc::new(
                TrackingDb::open(dir.join("tracking.db").to_str().unwrap()).unwrap(),
            ),
            catalog: Arc::new(CatalogDb::open(dir.join("catalog.db").to_str().unwrap()).unwrap()),
            stac: StacClient::new(vec![stac_url]),
            bucket: "cubes".to_string(),
            item_prefix: None,
        };
        (Arc::new(services), rx)
    }

    async fn drain(
        services: &Arc<Services>,
        rx: &mut mpsc::UnboundedReceiver<Activity>,
    ) -> usize {
        let mut processed = 0;
        while let Ok(activity) = rx.try_recv() {
            run_activity(services, activity).await;
            processed += 1;
        }
        processed
    }

    fn request(force: bool) -> CubeStartRequest {
        CubeStartRequest {
            datacube: "LC8_30".to_string(),
            version: 1,
            tiles: vec!["089098".to_string()],
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            force,
            shape: None,
            item_prefix: None,
        }
    }

    async fn fetch(services: &Services, key: &str) -> Raster {
        let bytes = services.storage.get("cubes", key).await.unwrap();
        cog::decode(&bytes).unwrap()
    }

    fn values_i16(raster: &Raster) -> Array2<i16> {
        raster.to_i16()
    }

    const STK_B4: &str =
        "LC8_30_STK/001/089098/2024-01-01_2024-01-16/LC8_30_STK_001_089098_2024-01-01_2024-01-16_B4.tif";

    #[tokio::test]
    async fn pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cube = cube();

        let storage_seed = LocalStore::new(dir.path().join("data"));
        let stac_payload = seed_sources(&storage_seed).await;
        let stac_url = spawn_stac(stac_payload).await;

        let (services, mut rx) = build_services(dir.path(), stac_url).await;
        seed_catalog(&services.catalog, &cube);

        let summary = start_cube_build(&services, &request(false)).await.unwrap();
        assert_eq!(summary.periods, 1);
        assert!(summary.skipped.is_empty());

        // 9 merges, 6 blends, 4 posblends (1 composite + 3 dates), 1 publish.
        let processed = drain(&services, &mut rx).await;
        assert_eq!(processed, 20);

        let prefix = "LC8_30_STK/001/089098/2024-01-01_2024-01-16/LC8_30_STK_001_089098_2024-01-01_2024-01-16";

        // Best-pixel composite carries the first clear acquisition.
        let stk = fetch(&services, STK_B4).await;
        assert!(values_i16(&stk).iter().all(|&v| v == 100));

        // Median of the two clear acquisitions.
        let med = fetch(
            &services,
            "LC8_30_MED/001/089098/2024-01-01_2024-01-16/LC8_30_MED_001_089098_2024-01-01_2024-01-16_B4.tif",
        )
        .await;
        assert!(values_i16(&med).iter().all(|&v| v == 150));

        // Observation statistics.
        let clearob = fetch(&services, &format!("{prefix}_CLEAROB.tif")).await;
        assert!(values_i16(&clearob).iter().all(|&v| v == 2));
        let totalob = fetch(&services, &format!("{prefix}_TOTALOB.tif")).await;
        assert!(values_i16(&totalob).iter().all(|&v| v == 3));
        let provenance = fetch(&services, &format!("{prefix}_PROVENANCE.tif")).await;
        assert!(values_i16(&provenance).iter().all(|&v| v == 4));

        // NDVI over the composites and over each date.
        let ndvi = fetch(&services, &format!("{prefix}_NDVI.tif")).await;
        assert!(values_i16(&ndvi).iter().all(|&v| v == 5000));
        let ndvi_idt = fetch(
            &services,
            "LC8_30_IDT/001/089098/2024-01-04/LC8_30_IDT_001_089098_2024-01-04_NDVI.tif",
        )
        .await;
        assert!(values_i16(&ndvi_idt).iter().all(|&v| v == 5000));

        // Every output of the (tile, period) shares one grid.
        for raster in [&stk, &med, &clearob, &totalob, &provenance, &ndvi] {
            assert_eq!(raster.transform, TILE_TRANSFORM);
            assert_eq!((raster.height(), raster.width()), (2, 2));
            assert_eq!(raster.crs, "EPSG:32723");
        }

        // Catalog items for the regular and the irregular cube.
        let stk_collection = services.catalog.get_collection("LC8_30_STK", 1).unwrap().unwrap();
        let item = services
            .catalog
            .get_item(stk_collection.id, "LC8_30_STK_001_089098_2024-01-01_2024-01-16")
            .unwrap()
            .unwrap();
        assert!(item.assets.get("thumbnail").is_some());
        assert!(item.assets.get("NDVI").is_some());
        assert!(item.assets.get("CLEAROB").is_some());

        let idt_collection = services.catalog.get_collection("LC8_30_IDT", 1).unwrap().unwrap();
        assert!(services
            .catalog
            .get_item(idt_collection.id, "LC8_30_IDT_001_089098_2024-01-04")
            .unwrap()
            .is_some());

        // The publish counter fired exactly once.
        let publish_control = services
            .tracking
            .get_control("publishLC8_300890982024-01-012024-01-16")
            .unwrap()
            .unwrap();
        assert_eq!(publish_control.mycount, 1);
        assert_eq!(publish_control.total, 1);

        // Re-driving an already-done merge overshoots its counter without
        // firing a second blend fan-out.
        let merge_key = "mergeLC8_30_IDT0890982024-01-04B4";
        let redriven = services.tracking.get_activity(merge_key, "2024-01-04").unwrap().unwrap();
        solo(&services, &[redriven.activity]).await.unwrap();
        let merge_control = services
            .tracking
            .get_control("mergeLC8_30_IDT0890982024-01-012024-01-16")
            .unwrap()
            .unwrap();
        assert_eq!(merge_control.mycount, 10);
        assert_eq!(merge_control.total, 9);
        assert_eq!(drain(&services, &mut rx).await, 0);

        // Second run without force: already published, nothing scheduled.
        let stk_before = services.storage.get("cubes", STK_B4).await.unwrap();
        let summary = start_cube_build(&services, &request(false)).await.unwrap();
        assert_eq!(summary.skipped, vec!["089098_2024-01-01_2024-01-16".to_string()]);
        assert_eq!(drain(&services, &mut rx).await, 0);
        let stk_after = services.storage.get("cubes", STK_B4).await.unwrap();
        assert_eq!(stk_before, stk_after);

        // Force rebuild: everything reruns, outputs stay byte-identical.
        let summary = start_cube_build(&services, &request(true)).await.unwrap();
        assert!(summary.skipped.is_empty());
        assert_eq!(drain(&services, &mut rx).await, 20);
        let stk_forced = services.storage.get("cubes", STK_B4).await.unwrap();
        assert_eq!(stk_before, stk_forced);
    }

    #[tokio::test]
    async fn empty_stac_surfaces_noscenes_error() {
        let dir = tempfile::tempdir().unwrap();
        let cube = cube();
        let stac_url = spawn_stac(serde_json::json!({ "features": [] })).await;

        let (services, mut rx) = build_services(dir.path(), stac_url).await;
        seed_catalog(&services.catalog, &cube);

        let summary = start_cube_build(&services, &request(false)).await.unwrap();
        assert!(summary.skipped.is_empty());
        assert_eq!(drain(&services, &mut rx).await, 0);

        let merge_key = "mergeLC8_30_IDT0890982024-01-012024-01-16";
        let row = services.tracking.get_activity(merge_key, "NOSCENES").unwrap().unwrap();
        assert_eq!(row.status, ActivityStatus::Error);
        assert_eq!(row.activity.errors.as_ref().unwrap().step, "prepare_merge");

        // The counter recorded the error without ever advancing.
        let control = services.tracking.get_control(merge_key).unwrap().unwrap();
        assert_eq!(control.mycount, 0);
        assert_eq!(control.errors, 1);
    }
}
