pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gitea;
pub mod http_client;
pub mod interpreter;
pub mod ledger;
pub mod persistence;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use engine::{EngineSettings, ReviewEngine};
pub use error::ReviewError;

pub const SERVICE_NAME: &str = "classroom-review";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

pub fn get_version() -> String {
    // Hash injected by the packaging build wins over git detection.
    if let Some(git_hash) = option_env!("CLASSROOM_REVIEW_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        "unknown".to_string()
    }
}

pub struct AppState {
    pub engine: Arc<ReviewEngine>,
    /// `None` disables webhook signature checks.
    pub webhook_secret: Option<String>,
    pub jwt_secret: String,
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": get_version(),
    }))
}

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(api::api_router())
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
