//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::{DecodeError, SagaError};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga engine error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::UnknownSaga(_) | SagaError::StepNotFound { .. } => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        SagaError::Decode(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::DuplicateSaga(_) | SagaError::InvalidTransition { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        SagaError::Persistence { .. } | SagaError::Channel(_) => {
            tracing::error!(error = %err, "saga backend unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "saga error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        ApiError::Saga(SagaError::Decode(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::Saga(SagaError::UnknownSaga(SagaId::new())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Saga(SagaError::DuplicateSaga(SagaId::new())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(DecodeError::UnknownEventType("X".into())),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
