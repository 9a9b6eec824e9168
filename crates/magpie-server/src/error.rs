use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use magpie_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Serialization(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let violations = match &self.0 {
            AppError::Validation(failure) => failure
                .violations
                .iter()
                .cloned()
                .map(Into::into)
                .collect(),
            _ => Vec::new(),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
            violations,
        };

        (status, axum::Json(body)).into_response()
    }
}
