use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::ProtocolError;
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Canceled: {0}")]
    Canceled(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ServerError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::AlreadyExists(_) => StatusCode::CONFLICT,
            ServerError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            ServerError::Aborted(_) => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // 499: client closed request / deadline passed
            ServerError::Canceled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ProtocolMismatch
            | ProtocolError::ChecksumMismatch
            | ProtocolError::ThreadIdMismatch { .. }
            | ProtocolError::RecipientMismatch { .. }
            | ProtocolError::Decode(_) => ServerError::InvalidArgument(e.to_string()),
            ProtocolError::IdentityMismatch | ProtocolError::NotAMember(_) => {
                ServerError::PermissionDenied(e.to_string())
            }
            ProtocolError::UnknownThread(_) => ServerError::NotFound(e.to_string()),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_taxonomy() {
        let cases = [
            (ProtocolError::ProtocolMismatch, StatusCode::BAD_REQUEST),
            (ProtocolError::IdentityMismatch, StatusCode::FORBIDDEN),
            (ProtocolError::ChecksumMismatch, StatusCode::BAD_REQUEST),
            (ProtocolError::NotAMember("g".into()), StatusCode::FORBIDDEN),
            (ProtocolError::UnknownThread("g".into()), StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            assert_eq!(ServerError::from(err).status(), status);
        }
    }

    #[test]
    fn store_not_found_is_not_found() {
        assert!(matches!(
            ServerError::from(StoreError::NotFound),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            ServerError::from(StoreError::Migration("boom".into())),
            ServerError::Internal(_)
        ));
    }

    #[test]
    fn canceled_uses_client_closed_status() {
        assert_eq!(ServerError::Canceled("deadline".into()).status().as_u16(), 499);
    }
}
