//! Scene-id parsers for the supported mission naming conventions.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static SENTINEL_2: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^S(?P<sensor>\w{1})(?P<satellite>[AB]{1})_MSI(?P<processingLevel>L[0-2][ABC])_(?P<acquisitionYear>[0-9]{4})(?P<acquisitionMonth>[0-9]{2})(?P<acquisitionDay>[0-9]{2})T(?P<acquisitionHMS>[0-9]{6})_N(?P<baseline_number>[0-9]{4})_R(?P<relative_orbit>[0-9]{3})_T(?P<utm>[0-9]{2})(?P<lat>\w{1})(?P<sq>\w{2})_(?P<stopDateTime>[0-9]{8}T[0-9]{6})$",
    )
    .expect("sentinel-2 scene pattern")
});

static LANDSAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^L(?P<sensor>\w{1})(?P<satellite>\w{2})_(?P<processingCorrectionLevel>\w{4})_(?P<path>[0-9]{3})(?P<row>[0-9]{3})_(?P<acquisitionYear>[0-9]{4})(?P<acquisitionMonth>[0-9]{2})(?P<acquisitionDay>[0-9]{2})_(?P<processingYear>[0-9]{4})(?P<processingMonth>[0-9]{2})(?P<processingDay>[0-9]{2})_(?P<collectionNumber>\w{2})_(?P<collectionCategory>\w{2})$",
    )
    .expect("landsat scene pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionGroup {
    Sentinel2,
    Landsat,
}

impl MissionGroup {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sentinel_2" => Some(Self::Sentinel2),
            "landsat" => Some(Self::Landsat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel2Scene {
    pub scene_id: String,
    pub sensor: String,
    pub satellite: String,
    pub processing_level: String,
    pub acquisition: NaiveDate,
    pub acquisition_hms: String,
    pub baseline_number: String,
    pub relative_orbit: String,
    pub utm: String,
    pub lat: String,
    pub sq: String,
    pub stop_datetime: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandsatScene {
    pub scene_id: String,
    pub sensor: String,
    pub satellite: String,
    pub processing_correction_level: String,
    pub path: String,
    pub row: String,
    pub acquisition: NaiveDate,
    pub processing_date: NaiveDate,
    pub collection_number: String,
    pub collection_category: String,
    pub instrument: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedScene {
    Sentinel2(Sentinel2Scene),
    Landsat(LandsatScene),
}

impl ParsedScene {
    pub fn acquisition(&self) -> NaiveDate {
        match self {
            ParsedScene::Sentinel2(s) => s.acquisition,
            ParsedScene::Landsat(s) => s.acquisition,
        }
    }
}

fn ymd(year: &str, month: &str, day: &str) -> anyhow::Result<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year.parse()?, month.parse()?, day.parse()?)
        .ok_or_else(|| anyhow::anyhow!("invalid date {year}-{month}-{day}"))?;
    Ok(date)
}

pub fn sentinel_2(scene_id: &str) -> anyhow::Result<Sentinel2Scene> {
    let caps = SENTINEL_2
        .captures(scene_id)
        .ok_or_else(|| anyhow::anyhow!("scene id does not match sentinel-2 pattern: {scene_id}"))?;

    Ok(Sentinel2Scene {
        scene_id: scene_id.to_string(),
        sensor: caps["sensor"].to_string(),
        satellite: caps["satellite"].to_string(),
        processing_level: caps["processingLevel"].to_string(),
        acquisition: ymd(
            &caps["acquisitionYear"],
            &caps["acquisitionMonth"],
            &caps["acquisitionDay"],
        )?,
        acquisition_hms: caps["acquisitionHMS"].to_string(),
        baseline_number: caps["baseline_number"].to_string(),
        relative_orbit: caps["relative_orbit"].to_string(),
        utm: caps["utm"].to_string(),
        lat: caps["lat"].to_string(),
        sq: caps["sq"].to_string(),
        stop_datetime: caps["stopDateTime"].to_string(),
    })
}

pub fn landsat(scene_id: &str) -> anyhow::Result<LandsatScene> {
    let caps = LANDSAT
        .captures(scene_id)
        .ok_or_else(|| anyhow::anyhow!("scene id does not match landsat pattern: {scene_id}"))?;

    let satellite = caps["satellite"].to_string();
    let instrument = match satellite.as_str() {
        "05" => "tm",
        "07" => "etm",
        "08" => "oli-tirs",
        other => anyhow::bail!("unknown landsat satellite number {other}"),
    };

    Ok(LandsatScene {
        scene_id: scene_id.to_string(),
        sensor: caps["sensor"].to_string(),
        satellite,
        processing_correction_level: caps["processingCorrectionLevel"].to_string(),
        path: caps["path"].to_string(),
        row: caps["row"].to_string(),
        acquisition: ymd(
            &caps["acquisitionYear"],
            &caps["acquisitionMonth"],
            &caps["acquisitionDay"],
        )?,
        processing_date: ymd(
            &caps["processingYear"],
            &caps["processingMonth"],
            &caps["processingDay"],
        )?,
        collection_number: caps["collectionNumber"].to_string(),
        collection_category: caps["collectionCategory"].to_string(),
        instrument,
    })
}

pub fn parse(group: MissionGroup, scene_id: &str) -> anyhow::Result<ParsedScene> {
    match group {
        MissionGroup::Sentinel2 => sentinel_2(scene_id).map(ParsedScene::Sentinel2),
        MissionGroup::Landsat => landsat(scene_id).map(ParsedScene::Landsat),
    }
}

/// Best-effort parse when the mission group is unknown: try every parser.
pub fn parse_any(scene_id: &str) -> Option<ParsedScene> {
    sentinel_2(scene_id)
        .map(ParsedScene::Sentinel2)
        .or_else(|_| landsat(scene_id).map(ParsedScene::Landsat))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinel_2_scene_id() {
        let scene =
            sentinel_2("S2A_MSIL2A_20240104T132231_N0510_R038_T23LLF_20240104T152000").unwrap();
        assert_eq!(scene.sensor, "2");
        assert_eq!(scene.satellite, "A");
        assert_eq!(scene.processing_level, "L2A");
        assert_eq!(scene.acquisition, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert_eq!(scene.relative_orbit, "038");
        assert_eq!(scene.utm, "23");
        assert_eq!(scene.lat, "L");
        assert_eq!(scene.sq, "LF");
    }

    #[test]
    fn parses_landsat_scene_id() {
        let scene = landsat("LC08_L2SP_220069_20240104_20240110_02_T1").unwrap();
        assert_eq!(scene.sensor, "C");
        assert_eq!(scene.satellite, "08");
        assert_eq!(scene.instrument, "oli-tirs");
        assert_eq!(scene.path, "220");
        assert_eq!(scene.row, "069");
        assert_eq!(scene.acquisition, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert_eq!(scene.collection_category, "T1");
    }

    #[test]
    fn rejects_foreign_ids() {
        assert!(sentinel_2("LC08_L2SP_220069_20240104_20240110_02_T1").is_err());
        assert!(landsat("S2A_MSIL2A_20240104T132231_N0510_R038_T23LLF_20240104T152000").is_err());
        assert!(parse_any("CBERS_4_MUX_20240104_154_117_L4").is_none());
    }

    #[test]
    fn parse_any_detects_group() {
        let parsed = parse_any("LT05_L2SP_220069_20100104_20200904_02_T1").unwrap();
        match parsed {
            ParsedScene::Landsat(ref s) => assert_eq!(s.instrument, "tm"),
            _ => panic!("expected landsat"),
        }
        assert_eq!(
            parsed.acquisition(),
            NaiveDate::from_ymd_opt(2010, 1, 4).unwrap()
        );
    }

    #[test]
    fn mission_group_lookup() {
        assert_eq!(MissionGroup::from_name("sentinel_2"), Some(MissionGroup::Sentinel2));
        assert_eq!(MissionGroup::from_name("landsat"), Some(MissionGroup::Landsat));
        assert_eq!(MissionGroup::from_name("modis"), None);
    }
}
