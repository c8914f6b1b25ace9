use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cube_builder::config::Config;
use cube_builder::queue::MemoryQueue;
use cube_builder::services::Services;
use cube_builder::{dispatcher, handlers, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("cube_builder=debug,tower_http=debug")
        }))
        .init();

    let config = Config::from_env();
    let (queue, rx) = MemoryQueue::channel();
    let services = Arc::new(Services::from_config(&config, Arc::new(queue))?);
    tracing::info!(
        "stores ready: tracking={} catalog={} data={}",
        config.tracking_db,
        config.catalog_db,
        config.data_dir
    );

    // Background worker loop draining the activity queue.
    dispatcher::spawn_dispatcher(services.clone(), rx);

    let state = AppState { services };

    let app = Router::new()
        .route("/api/v1/cubes/start", post(handlers::cubes::start_build))
        .route("/api/v1/control/{key}", get(handlers::cubes::control_status))
        .route("/api/v1/activities/{key}", get(handlers::cubes::list_activities))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("cube-builder listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
