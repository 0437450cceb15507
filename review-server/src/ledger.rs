//! External review ledger: the instructor-facing spreadsheet queue.
//!
//! Rows have four columns: student name, repository URL, request time and a
//! status label. Rows are addressed by their 1-based index as reported by the
//! append call. Deleting a row blanks its cells in place, so every index handed
//! out stays valid for the life of the sheet.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use review_core::{LedgerRowId, LedgerStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Timestamp layout of the request-time column.
const LEDGER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A new queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub full_name: String,
    pub repo_url: String,
    pub requested_at: DateTime<Utc>,
}

impl LedgerRow {
    /// Column values in sheet order. Times are rendered in UTC.
    pub fn values(&self) -> [String; 4] {
        [
            self.full_name.clone(),
            self.repo_url.clone(),
            self.requested_at.format(LEDGER_TIME_FORMAT).to_string(),
            LedgerStatus::AwaitingReview.label().to_string(),
        ]
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append a row and return its 1-based index.
    async fn append_review_request(&self, row: &LedgerRow) -> Result<LedgerRowId>;

    async fn update_row_status(&self, row: LedgerRowId, status: LedgerStatus) -> Result<()>;

    /// Blank a row. Later rows keep their indexes.
    async fn delete_row(&self, row: LedgerRowId) -> Result<()>;
}

/// Parse the row number out of an A1 range such as `ReviewRequests!A5:D5`.
pub fn parse_row_number(range: &str) -> Option<u32> {
    let digits_start = range
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    range[digits_start..].parse().ok().filter(|row| *row > 0)
}

/// The fields of a Google service-account key file this adapter uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials file {}", path.display()))
    }
}

pub enum SheetsAuth {
    ServiceAccount(ServiceAccountKey),
    /// Pre-issued OAuth access token.
    Bearer(String),
}

#[derive(Serialize)]
struct ServiceAccountClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: String,
}

/// Google Sheets ledger over the REST API.
pub struct SheetsLedger {
    client: ClientWithMiddleware,
    api_base: String,
    spreadsheet_id: String,
    sheet_name: String,
    auth: SheetsAuth,
    token_cache: Arc<RwLock<Option<(String, SystemTime)>>>,
}

impl SheetsLedger {
    pub fn new(
        client: ClientWithMiddleware,
        spreadsheet_id: impl Into<String>,
        sheet_name: impl Into<String>,
        auth: SheetsAuth,
    ) -> Self {
        Self {
            client,
            api_base: SHEETS_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
            auth,
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Point the adapter at a different API root.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// URL under `/spreadsheets`, each of `segments` pushed as one encoded path segment.
    fn spreadsheet_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.api_base).context("Invalid Sheets API base URL")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Sheets API base URL cannot have path segments"))?
            .pop_if_empty()
            .push("spreadsheets")
            .extend(segments);
        Ok(url)
    }

    fn generate_jwt(key: &ServiceAccountKey) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = ServiceAccountClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Failed to parse service account private key")?;
        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("Failed to encode service account JWT")
    }

    async fn access_token(&self) -> Result<String> {
        let key = match &self.auth {
            SheetsAuth::Bearer(token) => return Ok(token.clone()),
            SheetsAuth::ServiceAccount(key) => key,
        };

        // Reuse the cached token while it has more than five minutes left.
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.as_ref() {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let assertion = Self::generate_jwt(key)?;
        info!("Requesting new Sheets access token");

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Failed to send token exchange request")?;
        let response = Self::check(response, "token exchange").await?;
        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token exchange response")?;

        let expires_at = SystemTime::now() + Duration::from_secs(token.expires_in);
        *self.token_cache.write().await = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .context("Failed to read error response body")?;
        error!("Sheets API error during {}: {} - {}", what, status, error_text);
        Err(anyhow!("Sheets API error during {}: {} - {}", what, status, error_text))
    }
}

#[async_trait]
impl Ledger for SheetsLedger {
    async fn append_review_request(&self, row: &LedgerRow) -> Result<LedgerRowId> {
        let token = self.access_token().await?;
        let range = format!("{}!A:D:append", self.sheet_name);
        let mut url = self.spreadsheet_url(&[&self.spreadsheet_id, "values", &range])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&json!({ "values": [row.values()] }))
            .send()
            .await
            .context("Failed to send append request")?;
        let appended: AppendResponse = Self::check(response, "append row")
            .await?
            .json()
            .await
            .context("Failed to parse append response")?;

        let row_number = parse_row_number(&appended.updates.updated_range).ok_or_else(|| {
            anyhow!(
                "Could not parse row number from range {}",
                appended.updates.updated_range
            )
        })?;
        info!("Appended ledger row {} for {}", row_number, row.repo_url);
        Ok(LedgerRowId(row_number))
    }

    async fn update_row_status(&self, row: LedgerRowId, status: LedgerStatus) -> Result<()> {
        let token = self.access_token().await?;
        let range = format!("{}!D{}", self.sheet_name, row);
        let mut url = self.spreadsheet_url(&[&self.spreadsheet_id, "values", &range])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");

        let response = self
            .client
            .put(url)
            .bearer_auth(&token)
            .json(&json!({ "values": [[status.label()]] }))
            .send()
            .await
            .context("Failed to send update request")?;
        Self::check(response, "update row status").await?;
        info!("Ledger row {} marked {}", row, status.label());
        Ok(())
    }

    async fn delete_row(&self, row: LedgerRowId) -> Result<()> {
        let token = self.access_token().await?;
        let range = format!("{}!A{}:D{}:clear", self.sheet_name, row, row);
        let url = self.spreadsheet_url(&[&self.spreadsheet_id, "values", &range])?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&json!({}))
            .send()
            .await
            .context("Failed to send clear row request")?;
        Self::check(response, "clear row").await?;
        info!("Cleared ledger row {}", row);
        Ok(())
    }
}
