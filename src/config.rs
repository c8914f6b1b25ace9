use std::env;

/// Runtime configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket the cube outputs are written to.
    pub bucket: String,
    /// Root directory of the filesystem-backed object store.
    pub data_dir: String,
    /// SQLite path holding the activity and counter tables.
    pub tracking_db: String,
    /// SQLite path of the relational catalog.
    pub catalog_db: String,
    /// One or more STAC endpoints, comma separated.
    pub stac_urls: Vec<String>,
    /// Optional key prefix prepended to every cube path.
    pub item_prefix: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let stac_urls = env::var("STAC_URL")
            .unwrap_or_else(|_| "http://localhost:8082".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            bucket: env::var("BUCKET").unwrap_or_else(|_| "cubes".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            tracking_db: env::var("TRACKING_DB")
                .unwrap_or_else(|_| "./cube_tracking.db".to_string()),
            catalog_db: env::var("DB_URL").unwrap_or_else(|_| "./cube_catalog.db".to_string()),
            stac_urls,
            item_prefix: env::var("ITEM_PREFIX").ok().filter(|p| !p.is_empty()),
        }
    }
}
