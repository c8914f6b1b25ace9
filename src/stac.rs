//! STAC search client.
//!
//! Several catalogs can be configured; results are concatenated. The builder
//! only cares about asset links grouped by `(band, dataset, date)`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::scene_parser;

#[derive(Debug, Clone, Deserialize)]
pub struct StacAsset {
    pub href: String,
    #[serde(default)]
    pub nodata: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacFeature {
    pub id: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub assets: BTreeMap<String, StacAsset>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<StacFeature>,
}

/// One source scene asset for a `(band, dataset, date)` slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneLink {
    pub link: String,
    pub source_nodata: Option<f64>,
}

/// band -> dataset -> date -> scene assets.
pub type SceneMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<SceneLink>>>>;

pub struct StacClient {
    urls: Vec<String>,
    http: reqwest::Client,
}

impl StacClient {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls, http: reqwest::Client::new() }
    }

    /// POST `/search` against every configured catalog and concatenate the
    /// features. A catalog that errors is skipped with a warning; the call
    /// fails only when every catalog failed.
    pub async fn search(
        &self,
        bbox: [f64; 4],
        datetime: &str,
        collections: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<StacFeature>> {
        let body = serde_json::json!({
            "bbox": bbox,
            "datetime": datetime,
            "collections": collections,
            "limit": limit,
        });

        let mut features = Vec::new();
        let mut errors = Vec::new();
        for url in &self.urls {
            let endpoint = format!("{}/search", url.trim_end_matches('/'));
            let result = self
                .http
                .post(&endpoint)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(response) => match response.json::<FeatureCollection>().await {
                    Ok(fc) => features.extend(fc.features),
                    Err(e) => {
                        tracing::warn!("stac {endpoint}: bad payload: {e}");
                        errors.push(e.to_string());
                    }
                },
                Err(e) => {
                    tracing::warn!("stac {endpoint}: search failed: {e}");
                    errors.push(e.to_string());
                }
            }
        }

        if features.is_empty() && !errors.is_empty() && errors.len() == self.urls.len() {
            anyhow::bail!("all stac catalogs failed: {}", errors.join("; "));
        }
        Ok(features)
    }

    /// Scenes matching a tile footprint and period, grouped per band.
    pub async fn search_scenes(
        &self,
        geom: &Value,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
        datasets: &[String],
        bands: &[String],
    ) -> anyhow::Result<SceneMap> {
        let bbox = geojson_bbox(geom)
            .ok_or_else(|| anyhow::anyhow!("tile geometry has no coordinates"))?;
        let datetime = format!("{start}T00:00:00Z/{end}T23:59:59Z");

        let mut scenes = SceneMap::new();
        for dataset in datasets {
            let features = self
                .search(bbox, &datetime, std::slice::from_ref(dataset), 500)
                .await?;
            group_scenes(&mut scenes, &features, dataset, bands);
        }
        Ok(scenes)
    }
}

/// Fold search results into the `(band, dataset, date)` map. The acquisition
/// date comes from the scene id when it parses, from the `datetime` property
/// otherwise.
pub fn group_scenes(
    scenes: &mut SceneMap,
    features: &[StacFeature],
    dataset: &str,
    bands: &[String],
) {
    for feature in features {
        let date = match scene_parser::parse_any(&feature.id) {
            Some(parsed) => parsed.acquisition().to_string(),
            None => {
                let datetime = feature.properties.get("datetime").and_then(Value::as_str);
                match datetime {
                    Some(dt) if dt.len() >= 10 => dt[..10].to_string(),
                    _ => {
                        tracing::warn!("scene {} has no usable date, skipped", feature.id);
                        continue;
                    }
                }
            }
        };

        for band in bands {
            let Some(asset) = feature.assets.get(band) else { continue };
            scenes
                .entry(band.clone())
                .or_default()
                .entry(dataset.to_string())
                .or_default()
                .entry(date.clone())
                .or_default()
                .push(SceneLink {
                    link: asset.href.clone(),
                    source_nodata: asset.nodata,
                });
        }
    }
}

/// Bounding box `[xmin, ymin, xmax, ymax]` of a GeoJSON geometry.
pub fn geojson_bbox(geom: &Value) -> Option<[f64; 4]> {
    let mut bbox: Option<[f64; 4]> = None;
    collect_positions(geom.get("coordinates")?, &mut bbox);
    bbox
}

fn collect_positions(node: &Value, bbox: &mut Option<[f64; 4]>) {
    let Some(array) = node.as_array() else { return };
    if array.len() >= 2 && array[0].is_number() && array[1].is_number() {
        let x = array[0].as_f64().unwrap_or_default();
        let y = array[1].as_f64().unwrap_or_default();
        let entry = bbox.get_or_insert([x, y, x, y]);
        entry[0] = entry[0].min(x);
        entry[1] = entry[1].min(y);
        entry[2] = entry[2].max(x);
        entry[3] = entry[3].max(y);
        return;
    }
    for child in array {
        collect_positions(child, bbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bbox_of_polygon() {
        let geom = json!({
            "type": "Polygon",
            "coordinates": [[[-46.0, -23.5], [-45.0, -23.5], [-45.0, -22.5], [-46.0, -22.5], [-46.0, -23.5]]]
        });
        assert_eq!(geojson_bbox(&geom), Some([-46.0, -23.5, -45.0, -22.5]));
    }

    #[test]
    fn bbox_missing_coordinates() {
        assert_eq!(geojson_bbox(&json!({"type": "Polygon"})), None);
    }

    fn feature(id: &str, datetime: Option<&str>, assets: &[(&str, &str)]) -> StacFeature {
        StacFeature {
            id: id.to_string(),
            collection: None,
            properties: match datetime {
                Some(dt) => json!({"datetime": dt}),
                None => json!({}),
            },
            assets: assets
                .iter()
                .map(|(band, href)| {
                    (band.to_string(), StacAsset { href: href.to_string(), nodata: None })
                })
                .collect(),
        }
    }

    #[test]
    fn groups_by_band_dataset_and_date() {
        let features = vec![
            feature(
                "LC08_L2SP_220069_20240104_20240110_02_T1",
                None,
                &[("B4", "s3://a/B4.tif"), ("B8", "s3://a/B8.tif")],
            ),
            feature(
                "LC08_L2SP_220069_20240120_20240126_02_T1",
                None,
                &[("B4", "s3://b/B4.tif")],
            ),
        ];

        let mut scenes = SceneMap::new();
        group_scenes(
            &mut scenes,
            &features,
            "landsat-8-l2",
            &["B4".to_string(), "B8".to_string()],
        );

        let b4 = &scenes["B4"]["landsat-8-l2"];
        assert_eq!(b4.len(), 2);
        assert_eq!(b4["2024-01-04"][0].link, "s3://a/B4.tif");
        assert_eq!(b4["2024-01-20"][0].link, "s3://b/B4.tif");
        // B8 only exists for the first date.
        assert_eq!(scenes["B8"]["landsat-8-l2"].len(), 1);
    }

    #[test]
    fn falls_back_to_datetime_property() {
        let features = vec![feature(
            "CBERS_4_WFI_20240104_154_117_L4",
            Some("2024-01-04T13:22:31Z"),
            &[("BAND13", "s3://c/B13.tif")],
        )];

        let mut scenes = SceneMap::new();
        group_scenes(&mut scenes, &features, "cbers4-wfi", &["BAND13".to_string()]);
        assert!(scenes["BAND13"]["cbers4-wfi"].contains_key("2024-01-04"));
    }

    #[test]
    fn two_scenes_same_date_stack_in_order() {
        let features = vec![
            feature("LC08_L2SP_220069_20240104_20240110_02_T1", None, &[("B4", "s3://a/B4.tif")]),
            feature("LC08_L2SP_220070_20240104_20240110_02_T1", None, &[("B4", "s3://b/B4.tif")]),
        ];

        let mut scenes = SceneMap::new();
        group_scenes(&mut scenes, &features, "landsat-8-l2", &["B4".to_string()]);
        let links = &scenes["B4"]["landsat-8-l2"]["2024-01-04"];
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link, "s3://a/B4.tif");
        assert_eq!(links[1].link, "s3://b/B4.tif");
    }
}
