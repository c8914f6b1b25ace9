use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use crate::AppState;
use crate::orchestrator::{start_cube_build, CubeStartRequest};

/// Trigger a cube build: orchestrate the `(tile, period)` set and fan out the
/// merge activities.
pub async fn start_build(
    State(state): State<AppState>,
    Json(request): Json<CubeStartRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let summary = start_cube_build(&state.services, &request).await.map_err(|e| {
        tracing::error!("cube start failed: {e}");
        (StatusCode::BAD_REQUEST, format!("cube start failed: {e}"))
    })?;

    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// Counter snapshot of one control key.
pub async fn control_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let row = state
        .services
        .tracking
        .get_control(&key)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("lookup failed: {e}")))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no control row for {key}")))?;

    Ok(Json(json!({
        "id": row.id,
        "mycount": row.mycount,
        "totalInstancesToBeDone": row.total,
        "end_date": row.end_date,
        "errors": row.errors,
    })))
}

/// Activity rows sharing one dynamo key.
pub async fn list_activities(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = state
        .services
        .tracking
        .activities_by_key(&key)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("lookup failed: {e}")))?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.id,
                "sk": row.sk,
                "mystatus": row.status.as_str(),
                "efficacy": row.efficacy,
                "cloudratio": row.cloudratio,
                "errors": row.activity.errors,
            })
        })
        .collect();
    Ok(Json(items))
}
