//! ---
//! kormit_section: "05-networking-external-interfaces"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Translation of core errors into HTTP responses."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kormit_core::CoreError;
use kormit_runtime::RuntimeError;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ReplicaNotReady { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Runtime(RuntimeError::ImageNotFound(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Runtime(RuntimeError::Conflict(_)) => StatusCode::CONFLICT,
            CoreError::Runtime(RuntimeError::ResourceExhausted(_)) => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            CoreError::Runtime(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::from(CoreError::InvalidSpec("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CoreError::deployment_not_found("d")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(CoreError::RuntimeUnavailable("down".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(CoreError::Runtime(RuntimeError::ResourceExhausted("disk".into())))
                .status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }
}
