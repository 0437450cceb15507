use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

use review_server::config::{Config, LedgerCredentials};
use review_server::gitea::{GiteaAccessController, GiteaClient, WebhookRegistration};
use review_server::http_client::create_http_client;
use review_server::ledger::{Ledger, ServiceAccountKey, SheetsAuth, SheetsLedger};
use review_server::persistence::SqliteRepository;
use review_server::worker::ReconciliationWorker;
use review_server::{app_router, get_version, AppState, EngineSettings, ReviewEngine};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting classroom review service ({})", get_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let http_client = create_http_client().context("Failed to build HTTP client")?;
    let gitea = GiteaClient::new(http_client.clone(), &config.gitea_url);
    let access = Arc::new(GiteaAccessController::new(
        gitea,
        config.gitea_admin_token.clone(),
    ));

    let ledger: Option<Arc<dyn Ledger>> = match &config.ledger {
        Some(ledger) => {
            let auth = match &ledger.credentials {
                LedgerCredentials::ServiceAccountFile(path) => {
                    SheetsAuth::ServiceAccount(ServiceAccountKey::from_file(path)?)
                }
                LedgerCredentials::AccessToken(token) => SheetsAuth::Bearer(token.clone()),
            };
            info!(
                "Ledger enabled: spreadsheet {} sheet {}",
                ledger.spreadsheet_id, ledger.sheet_name
            );
            Some(Arc::new(SheetsLedger::new(
                http_client,
                &ledger.spreadsheet_id,
                &ledger.sheet_name,
                auth,
            )))
        }
        None => {
            info!("Ledger disabled");
            None
        }
    };

    let webhook = match (&config.webhook_base_url, &config.webhook_secret) {
        (Some(base_url), Some(secret)) => Some(WebhookRegistration::for_base_url(base_url, secret)),
        _ => None,
    };
    if config.webhook_secret.is_none() {
        info!("GITEA_WEBHOOK_SECRET not set; webhook signatures will not be checked");
    }

    let db_path = config.state_dir.join("classroom-review.db");
    info!("Using database: {}", db_path.display());
    let repository =
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?;

    let engine = Arc::new(ReviewEngine::new(
        Arc::new(repository),
        access,
        ledger,
        EngineSettings {
            pending_window: config.pending_window,
            protected_branch: config.protected_branch.clone(),
            webhook,
        },
    ));

    // Pending requests from before a restart get their windows back before any
    // request can race the worker.
    let restored = engine
        .restore_pending_windows()
        .await
        .context("Failed to restore pending review windows")?;
    info!("Restored {} pending review windows", restored);

    let worker = ReconciliationWorker::start(engine.clone(), config.worker_interval);

    let state = Arc::new(AppState {
        engine,
        webhook_secret: config.webhook_secret.clone(),
        jwt_secret: config.jwt_secret.clone(),
    });
    let app = app_router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker.stop().await;

    Ok(())
}
