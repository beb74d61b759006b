//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use respool_id::RequestId;

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Also the allocation request id for apply calls.
    pub request_id: RequestId,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = match header_string(&parts.headers, REQUEST_ID_HEADER) {
            Some(raw) if !raw.is_empty() => raw.parse::<RequestId>().map_err(|e| {
                ApiError::bad_request(
                    "invalid_request_id",
                    format!("{REQUEST_ID_HEADER} must be a req_ id: {e}"),
                )
                .with_request_id(raw.clone())
            })?,
            _ => RequestId::new(),
        };

        Ok(Self { request_id })
    }
}
