//! Authenticated HTTP API for students and instructors.
//!
//! Unlike the webhook, these endpoints report failures with real status codes.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use review_core::{ReviewRequest, ReviewRequestId, SubmissionId, User, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{RequestOutcome, ReviewStatusView};
use crate::error::ReviewError;
use crate::AppState;

/// Bearer token claims. `exp` is checked by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: u64,
    pub exp: usize,
}

/// The user a valid bearer token resolves to.
pub struct AuthUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ReviewError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| ReviewError::Unauthorized("missing bearer token".to_string()))?;

        let claims = decode::<Claims>(
            token.trim(),
            &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            ReviewError::Unauthorized("invalid token".to_string())
        })?
        .claims;

        let user = state
            .engine
            .user(UserId(claims.user_id))
            .await?
            .ok_or_else(|| ReviewError::Unauthorized("unknown user".to_string()))?;
        Ok(AuthUser(user))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkReviewedParams {
    /// Instructor override: accept a request still inside its window.
    #[serde(default)]
    pub allow_pending: bool,
}

fn parse_id<T: From<u64>>(raw: &str, what: &str) -> Result<T, ReviewError> {
    raw.parse::<u64>()
        .map(T::from)
        .map_err(|_| ReviewError::Validation(format!("invalid {} id: {}", what, raw)))
}

async fn request_review(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RequestOutcome>), ReviewError> {
    let submission_id: SubmissionId = parse_id(&id, "submission")?;
    let outcome = state
        .engine
        .request_review(submission_id, &user.username)
        .await?;
    info!(
        "{} requested review {} of submission {}",
        user.username, outcome.review_request.id, submission_id
    );
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn cancel_review(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ReviewRequest>, ReviewError> {
    let id: ReviewRequestId = parse_id(&id, "review request")?;
    let review = state.engine.cancel_review(id, &user.username).await?;
    info!("{} cancelled review request {}", user.username, id);
    Ok(Json(review))
}

async fn review_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReviewStatusView>, ReviewError> {
    let submission_id: SubmissionId = parse_id(&id, "submission")?;
    Ok(Json(state.engine.review_status(submission_id).await?))
}

async fn mark_reviewed(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(params): Query<MarkReviewedParams>,
) -> Result<Json<ReviewRequest>, ReviewError> {
    let id: ReviewRequestId = parse_id(&id, "review request")?;
    let review = state
        .engine
        .review(id)
        .await?
        .ok_or_else(|| ReviewError::NotFound(format!("review request {} not found", id)))?;
    let submission = state
        .engine
        .submission(review.submission_id)
        .await?
        .ok_or_else(|| {
            ReviewError::NotFound(format!("submission {} not found", review.submission_id))
        })?;

    let authorized = state
        .engine
        .authorize_user(&user, &submission)
        .await?
        .ok_or_else(|| {
            ReviewError::Forbidden("only course instructors can mark reviews".to_string())
        })?;

    Ok(Json(
        state
            .engine
            .mark_reviewed(id, &authorized, params.allow_pending)
            .await?,
    ))
}

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submissions/{id}/review/request", post(request_review))
        .route("/submissions/{id}/review/status", get(review_status))
        .route("/reviews/{id}/cancel", delete(cancel_review))
        .route("/reviews/{id}/mark-reviewed", post(mark_reviewed))
}
