//! Inventory import endpoint.
//!
//! Discovery and probing happen elsewhere; this only accepts finished
//! records and upserts them into the pool.

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::ResourceRecord;
use crate::state::AppState;

const MAX_IMPORT_RECORDS: usize = 5_000;

/// Resource routes, under /v1/resources.
pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(import_resources))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub records: Vec<ResourceRecord>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub upserted: u64,
}

async fn import_resources(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ImportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.to_string();

    if req.records.is_empty() {
        return Err(
            ApiError::bad_request("invalid_records", "records cannot be empty")
                .with_request_id(request_id),
        );
    }
    if req.records.len() > MAX_IMPORT_RECORDS {
        return Err(ApiError::bad_request(
            "invalid_records",
            format!("at most {MAX_IMPORT_RECORDS} records per import"),
        )
        .with_request_id(request_id));
    }

    let upserted = state
        .allocations()
        .import(&req.records)
        .await
        .map_err(|e| ApiError::from_allocation(e, request_id))?;

    Ok(Json(ImportResponse { upserted }))
}
