use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{
    allocation_result_json, DepartmentAllocationRequest, EmergencyAllocationRequest,
    TargetedAllocationRequest,
};
use crate::state::AppState;

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[axum::debug_handler]
pub async fn allocate_targeted(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TargetedAllocationRequest>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let result = state
        .engine
        .allocate_targeted(request.into(), &correlation_id)
        .await?;
    Ok(Json(allocation_result_json(&result)))
}

#[axum::debug_handler]
pub async fn allocate_department(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DepartmentAllocationRequest>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let result = state
        .engine
        .allocate_department(request.into(), &correlation_id)
        .await?;
    Ok(Json(allocation_result_json(&result)))
}

/// The emergency endpoint runs its own restricted-to-today search over the
/// department's slots (direct capacity, then a preemptible occupant, then
/// the earliest active slot regardless of capacity) rather than the
/// forward-looking search `allocate_department` performs.
#[axum::debug_handler]
pub async fn allocate_emergency(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmergencyAllocationRequest>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let result = state
        .engine
        .allocate_emergency_department(request.into(), &correlation_id)
        .await?;
    Ok(Json(allocation_result_json(&result)))
}

#[axum::debug_handler]
pub async fn confirm_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let token = state.engine.confirm(&token_id, &correlation_id).await?;
    Ok(Json(json!(token)))
}

#[axum::debug_handler]
pub async fn complete_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let token = state.engine.complete(&token_id, &correlation_id).await?;
    Ok(Json(json!(token)))
}

#[axum::debug_handler]
pub async fn cancel_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let token = state.engine.cancel(&token_id, &correlation_id).await?;
    Ok(Json(json!(token)))
}

#[axum::debug_handler]
pub async fn noshow_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let correlation_id = correlation_id();
    let token = state.engine.noshow(&token_id, &correlation_id).await?;
    Ok(Json(json!(token)))
}

#[axum::debug_handler]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": if state.background.is_healthy() { "ok" } else { "degraded" },
    }))
}
