//! Outgoing HTTP client shared by the Gitea and ledger adapters.

use std::time::Instant;

use axum::http;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tracing::debug;
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

tokio::task_local! {
    /// Correlation id of the inbound delivery being handled on this task.
    pub static CORRELATION_ID: String;
}

/// The current task's correlation id, or a fresh one.
pub fn current_correlation_id() -> String {
    CORRELATION_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| Uuid::new_v4().to_string())
}

/// Stamps outgoing requests with `X-Correlation-ID` and logs their outcome.
pub struct CorrelationMiddleware;

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = http::HeaderValue::from_str(&current_correlation_id()) {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let method = req.method().clone();
        let url = req.url().clone();
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => debug!(
                correlation_id = %correlation_id,
                "{} {} -> {} in {:?}",
                method,
                url,
                resp.status(),
                started.elapsed()
            ),
            Err(err) => debug!(
                correlation_id = %correlation_id,
                "{} {} failed after {:?}: {}",
                method,
                url,
                started.elapsed(),
                err
            ),
        }

        response
    }
}

pub fn create_http_client() -> anyhow::Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(concat!("classroom-review/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    Ok(ClientBuilder::new(client)
        .with(CorrelationMiddleware)
        .build())
}
