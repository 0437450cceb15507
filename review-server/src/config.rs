use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PENDING_MINUTES: u64 = 15;
const DEFAULT_WORKER_INTERVAL_SECS: u64 = 30;

/// Where the ledger gets its OAuth token from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCredentials {
    ServiceAccountFile(PathBuf),
    AccessToken(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub credentials: LedgerCredentials,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Directory holding `classroom-review.db`. Defaults to the working directory.
    pub state_dir: PathBuf,
    /// HS256 secret for API bearer tokens.
    pub jwt_secret: String,
    pub gitea_url: String,
    /// Used for collaborator changes and hook registration.
    pub gitea_admin_token: Option<String>,
    /// When unset, webhook signatures are not checked.
    pub webhook_secret: Option<String>,
    /// Public base URL; hooks are registered at `<base>/webhooks/gitea`.
    pub webhook_base_url: Option<String>,
    pub pending_window: Duration,
    pub worker_interval: Duration,
    pub protected_branch: String,
    /// `None` disables the ledger.
    pub ledger: Option<LedgerConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = var("PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let jwt_secret = var("JWT_SECRET").context("JWT_SECRET environment variable is required")?;

        let gitea_url = var("GITEA_URL")
            .context("GITEA_URL environment variable is required")?
            .trim_end_matches('/')
            .to_string();

        let pending_window = Duration::from_secs(
            parse_positive(var("REVIEW_PENDING_MINUTES").as_deref())
                .unwrap_or(DEFAULT_PENDING_MINUTES)
                * 60,
        );

        let worker_interval = match var("REVIEW_WORKER_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .context("REVIEW_WORKER_INTERVAL_SECS must be a positive number")?,
            ),
            None => Duration::from_secs(DEFAULT_WORKER_INTERVAL_SECS),
        };

        let ledger = match var("GOOGLE_SHEET_ID") {
            None => None,
            Some(spreadsheet_id) => {
                let credentials = if let Some(path) = var("GOOGLE_CREDENTIALS_FILE") {
                    LedgerCredentials::ServiceAccountFile(PathBuf::from(path))
                } else if let Some(token) = var("GOOGLE_ACCESS_TOKEN") {
                    LedgerCredentials::AccessToken(token)
                } else {
                    anyhow::bail!(
                        "GOOGLE_SHEET_ID is set but neither GOOGLE_CREDENTIALS_FILE nor GOOGLE_ACCESS_TOKEN is"
                    );
                };
                Some(LedgerConfig {
                    spreadsheet_id,
                    sheet_name: var("GOOGLE_SHEET_NAME")
                        .unwrap_or_else(|| "ReviewRequests".to_string()),
                    credentials,
                })
            }
        };

        Ok(Config {
            port,
            state_dir,
            jwt_secret,
            gitea_url,
            gitea_admin_token: var("GITEA_ADMIN_TOKEN"),
            webhook_secret: var("GITEA_WEBHOOK_SECRET"),
            webhook_base_url: var("WEBHOOK_BASE_URL"),
            pending_window,
            worker_interval,
            protected_branch: var("PROTECTED_BRANCH").unwrap_or_else(|| "main".to_string()),
            ledger,
        })
    }
}

/// Positive integer, or `None` for anything else.
fn parse_positive(raw: Option<&str>) -> Option<u64> {
    raw?.trim().parse::<i64>().ok().filter(|n| *n > 0).map(|n| n as u64)
}
