pub mod blend;
pub mod catalog_db;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod posblend;
pub mod publish;
pub mod queue;
pub mod raster;
pub mod scene_parser;
pub mod services;
pub mod stac;
pub mod storage;
pub mod timeline;
pub mod tracking_db;

use std::sync::Arc;

use services::Services;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}
