//! Gitea webhook ingress.
//!
//! The route layer authenticates the raw body and tags the delivery with a
//! correlation id; the handler classifies the event and hands it to
//! [`dispatch::dispatch`].

pub mod dispatch;
pub mod payload;
pub mod signature;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use self::dispatch::{dispatch, WebhookOutcome};
use self::payload::GiteaEvent;
use self::signature::verify_signature;
use crate::error::ReviewError;
use crate::http_client::CORRELATION_ID;
use crate::AppState;

pub const EVENT_HEADER: &str = "X-Gitea-Event";
pub const SIGNATURE_HEADER: &str = "X-Gitea-Signature";

/// Id attached to one webhook delivery and every outgoing call it makes.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ReviewError> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ReviewError::Validation(format!("unreadable request body: {}", e)))?;

    if let Some(secret) = &state.webhook_secret {
        let signature = parts
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &bytes, signature) {
            warn!(
                correlation_id = %correlation_id.0,
                "Rejected webhook with invalid signature"
            );
            return Err(ReviewError::Unauthorized("invalid signature".to_string()));
        }
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(correlation_id);

    Ok(next.run(request).await)
}

pub async fn gitea_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookOutcome>, ReviewError> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let event_type = request
        .headers()
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| ReviewError::Validation(format!("unreadable request body: {}", e)))?;

    let span = info_span!(
        "webhook",
        correlation_id = %correlation_id,
        event = %event_type
    );
    let handle = async move {
        let event = GiteaEvent::parse(&event_type, &bytes).map_err(|e| {
            ReviewError::Validation(format!("invalid {} payload: {}", event_type, e))
        })?;
        info!("Received {} webhook", event.kind());

        let outcome = dispatch(&state.engine, event).await?;
        info!(?outcome, "Webhook handled");
        Ok::<_, ReviewError>(Json(outcome))
    };

    CORRELATION_ID
        .scope(correlation_id, handle.instrument(span))
        .await
}

pub fn webhook_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/gitea", post(gitea_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests;
