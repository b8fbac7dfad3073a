use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use replication::ReplicationError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    MembershipConflict(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Unavailable { .. } => ApiError::Unavailable(err.to_string()),
            ReplicationError::MembershipConflict { .. } => ApiError::MembershipConflict(err.to_string()),
            ReplicationError::InvalidKey(msg) => ApiError::InvalidKey(msg),
            ReplicationError::InvalidValue(msg) => ApiError::InvalidValue(msg),
            ReplicationError::InvalidConfig(msg) => ApiError::InvalidRequest(msg),
            ReplicationError::Timeout(msg) => ApiError::Timeout(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Unavailable"),
            ApiError::MembershipConflict(_) => (StatusCode::SERVICE_UNAVAILABLE, "MembershipConflict"),
            ApiError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "InvalidKey"),
            ApiError::InvalidValue(_) => (StatusCode::BAD_REQUEST, "InvalidValue"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "Timeout"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::warn!(code, error = %self, "Request failed");
        }

        let body = ErrorBody {
            code,
            message: self.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_errors_map_to_statuses() {
        let cases = [
            (
                ReplicationError::Unavailable {
                    required: 2,
                    available: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ReplicationError::MembershipConflict { epoch: 4 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ReplicationError::InvalidKey("empty".into()), StatusCode::BAD_REQUEST),
            (ReplicationError::InvalidValue("big".into()), StatusCode::BAD_REQUEST),
            (ReplicationError::Timeout("b".into()), StatusCode::GATEWAY_TIMEOUT),
            (ReplicationError::Replica("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn unavailable_message_names_the_shortfall() {
        let err = ApiError::from(ReplicationError::Unavailable {
            required: 2,
            available: 1,
        });
        assert!(err.to_string().contains("1 of 2"));
    }
}
