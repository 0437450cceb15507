//! Errors surfaced by review operations, and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use review_core::TransitionError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::persistence::RepositoryError;

#[derive(Debug, Error)]
pub enum ReviewError {
    /// Malformed id or body.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    /// The submission already has an active review request.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// The request is not in a status that allows the operation.
    #[error("{0}")]
    InvalidState(String),

    /// The cancellation window has closed.
    #[error("{0}")]
    Expired(String),

    /// Storage failure. The message is logged, never returned to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReviewError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidState(_) | Self::Expired(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RepositoryError> for ReviewError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ActiveReviewExists(_) => {
                Self::Conflict("submission already has an active review request".to_string())
            }
            RepositoryError::ReviewNotFound(_) => {
                Self::NotFound("review request not found".to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TransitionError> for ReviewError {
    fn from(err: TransitionError) -> Self {
        Self::InvalidState(err.to_string())
    }
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Internal(detail) => {
                error!("Internal error while handling review request: {}", detail);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_core::{ReviewStatus, SubmissionId};

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (ReviewError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ReviewError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (ReviewError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ReviewError::Conflict("x".into()), StatusCode::CONFLICT),
            (ReviewError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ReviewError::InvalidState("x".into()), StatusCode::BAD_REQUEST),
            (ReviewError::Expired("x".into()), StatusCode::BAD_REQUEST),
            (
                ReviewError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{:?}", err);
        }
    }

    #[test]
    fn test_repository_errors_map_to_taxonomy() {
        let conflict: ReviewError = RepositoryError::ActiveReviewExists(SubmissionId(1)).into();
        assert!(matches!(conflict, ReviewError::Conflict(_)));

        let storage: ReviewError = RepositoryError::storage("save_review", "disk full").into();
        assert!(matches!(storage, ReviewError::Internal(_)));
    }

    #[test]
    fn test_transition_error_is_invalid_state() {
        let err: ReviewError = TransitionError::InvalidTransition {
            from: ReviewStatus::Reviewed,
            event: "CancelRequested",
        }
        .into();
        assert!(matches!(err, ReviewError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_internal_detail_is_not_leaked() {
        let response = ReviewError::Internal("secret path /var/db".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("/var/db"));
        assert!(text.contains("internal server error"));
    }
}
