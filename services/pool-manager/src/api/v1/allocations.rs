//! Allocation endpoints: apply, confirm, rollback.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use respool_id::RequestId;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{ApplyRequest, HostId, ResourceRecord};
use crate::state::AppState;

/// Allocation routes, under /v1/allocations.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/apply", post(apply))
        .route("/{request_id}/confirm", post(confirm))
        .route("/{request_id}/rollback", post(rollback))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Host ids previously returned by apply.
#[derive(Debug, Deserialize)]
pub struct HostIdsRequest {
    pub host_ids: Vec<HostId>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub request_id: RequestId,
    pub confirmed: Vec<ResourceRecord>,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub request_id: RequestId,
    pub released: u64,
}

// =============================================================================
// Handlers
// =============================================================================

/// Reserve hosts for every group, or report feasibility for a dry run.
async fn apply(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ApplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let outcome = state
        .allocations()
        .apply(request_id, &req)
        .await
        .map_err(|e| ApiError::from_allocation(e, request_id.to_string()))?;

    let status = if outcome.dry_run {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

async fn confirm(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(request_id): Path<String>,
    Json(req): Json<HostIdsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = parse_request_id(&request_id, &ctx)?;
    let confirmed = state
        .allocations()
        .confirm(&request_id, &req.host_ids)
        .await
        .map_err(|e| ApiError::from_allocation(e, ctx.request_id.to_string()))?;

    Ok(Json(ConfirmResponse {
        request_id,
        confirmed,
    }))
}

async fn rollback(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(request_id): Path<String>,
    Json(req): Json<HostIdsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = parse_request_id(&request_id, &ctx)?;
    let released = state
        .allocations()
        .rollback(&request_id, &req.host_ids)
        .await
        .map_err(|e| ApiError::from_allocation(e, ctx.request_id.to_string()))?;

    Ok(Json(RollbackResponse {
        request_id,
        released,
    }))
}

fn parse_request_id(raw: &str, ctx: &RequestContext) -> Result<RequestId, ApiError> {
    raw.parse::<RequestId>().map_err(|e| {
        ApiError::bad_request("invalid_request_id", format!("invalid request id '{raw}': {e}"))
            .with_request_id(ctx.request_id.to_string())
    })
}
