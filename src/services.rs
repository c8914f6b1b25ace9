//! The capability record handed to every stage function. All external I/O of
//! the pipeline flows through this one struct, so workers and tests wire in
//! whatever backends they need.

use std::sync::Arc;

use crate::catalog_db::CatalogDb;
use crate::config::Config;
use crate::queue::ActivityQueue;
use crate::stac::StacClient;
use crate::storage::ObjectStore;
use crate::tracking_db::TrackingDb;

pub struct Services {
    pub storage: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn ActivityQueue>,
    pub tracking: Arc<TrackingDb>,
    pub catalog: Arc<CatalogDb>,
    pub stac: StacClient,
    pub bucket: String,
    pub item_prefix: Option<String>,
}

impl Services {
    pub fn from_config(
        config: &Config,
        queue: Arc<dyn ActivityQueue>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            storage: Arc::new(crate::storage::LocalStore::new(&config.data_dir)),
            queue,
            tracking: Arc::new(TrackingDb::open(&config.tracking_db)?),
            catalog: Arc::new(CatalogDb::open(&config.catalog_db)?),
            stac: StacClient::new(config.stac_urls.clone()),
            bucket: config.bucket.clone(),
            item_prefix: config.item_prefix.clone(),
        })
    }
}
