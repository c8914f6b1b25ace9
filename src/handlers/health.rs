use axum::{Json, extract::State, http::StatusCode};
use serde_json::{json, Value};

use crate::AppState;

/// Readiness probe: the builder is healthy only while both durable stores
/// answer queries.
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let tracking = state.services.tracking.ping();
    let catalog = state.services.catalog.ping();

    let status_of = |probe: &anyhow::Result<()>| match probe {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };

    let body = json!({
        "status": if tracking.is_ok() && catalog.is_ok() { "ok" } else { "degraded" },
        "tracking": status_of(&tracking),
        "catalog": status_of(&catalog),
    });

    let code = if tracking.is_ok() && catalog.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
