use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use switchyard_failover::FailoverError;

/// Error surface of the HTTP API: 401 for bad credentials, 400 for bad
/// admin input, 500 for everything unexpected.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid authentication credentials".to_string(),
            ),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Internal(err) => {
                tracing::error!(%err, "internal error handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<FailoverError> for ApiError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::UnknownProvider(provider) => {
                Self::BadRequest(format!("unknown provider: {provider}"))
            }
            FailoverError::LockTimeout => Self::Internal(anyhow::anyhow!(err)),
        }
    }
}

impl From<switchyard_queue::QueueError> for ApiError {
    fn from(err: switchyard_queue::QueueError) -> Self {
        Self::Internal(anyhow::anyhow!(err))
    }
}
