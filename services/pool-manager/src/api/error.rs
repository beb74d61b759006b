//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::allocation::AllocationError;
use crate::store::StoreError;

/// Seconds a client should wait before retrying after lock contention.
const LOCK_RETRY_AFTER_SECONDS: u32 = 1;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://respool.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
            details: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.problem.retryable = retryable;
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }

    /// Map an engine failure, naming the short group where there is one.
    pub fn from_allocation(err: AllocationError, request_id: impl Into<String>) -> Self {
        let message = err.to_string();
        let retryable = err.is_retryable();
        let group_detail = err.group_mark().map(|mark| {
            vec![FieldError {
                field: format!("groups.{mark}"),
                message: message.clone(),
            }]
        });

        let api_error = match err {
            AllocationError::InvalidRequest(_) => Self::bad_request("invalid_request", message),
            AllocationError::Insufficient { .. } => {
                Self::conflict("insufficient_resources", message)
            }
            AllocationError::Exhausted { .. } => Self::conflict("affinity_unsatisfiable", message),
            AllocationError::RaceLost { .. } => Self::conflict("reservation_race_lost", message),
            AllocationError::ConfirmMismatch { .. } => Self::conflict("confirm_mismatch", message),
            AllocationError::LockTimeout { .. } => {
                Self::service_unavailable("scope_lock_timeout", message)
                    .with_retry_after_seconds(LOCK_RETRY_AFTER_SECONDS)
            }
            AllocationError::Lock(e) => {
                error!(error = %e, "Scope lock backend failure");
                Self::service_unavailable("lock_unavailable", "Scope lock backend unavailable")
                    .with_retry_after_seconds(LOCK_RETRY_AFTER_SECONDS)
            }
            AllocationError::Store(StoreError::Conflict(_)) => {
                Self::conflict("import_conflict", message)
            }
            AllocationError::Store(e) => {
                error!(error = %e, "Resource store failure");
                Self::internal("store_error", "Resource store operation failed")
            }
            AllocationError::Internal(e) => {
                error!(error = %e, "Reservation task failure");
                Self::internal("internal_error", "Reservation did not complete")
            }
        };

        let api_error = api_error.with_retryable(retryable).with_request_id(request_id);
        match group_detail {
            Some(details) => api_error.with_details(details),
            None => api_error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
