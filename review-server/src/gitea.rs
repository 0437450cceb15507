//! Gitea API client and the access controller built on it.
//!
//! Every mutation is idempotent: granting an access level that is already set,
//! protecting a protected branch, unprotecting an unprotected one, or registering
//! a hook that already exists all succeed without changing anything.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use review_core::{AccessLevel, RepoRef};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Events a repository hook must deliver for the review flow.
pub const WEBHOOK_EVENTS: [&str; 3] = ["pull_request", "pull_request_review", "issue_comment"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRegistration {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}

impl WebhookRegistration {
    /// Registration for `<base_url>/webhooks/gitea` with the standard event set.
    pub fn for_base_url(base_url: &str, secret: &str) -> Self {
        Self {
            url: format!("{}/webhooks/gitea", base_url.trim_end_matches('/')),
            secret: secret.to_string(),
            events: WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Team {
    id: u64,
    name: String,
}

/// Page size for list endpoints; a shorter page is the last one.
const PAGE_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
struct Hook {
    #[serde(default)]
    config: HookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfig {
    #[serde(default)]
    url: String,
}

#[derive(Serialize)]
struct AddCollaboratorRequest<'a> {
    permission: &'a str,
}

#[derive(Serialize)]
struct CreateBranchProtectionRequest<'a> {
    branch_name: &'a str,
    rule_name: &'a str,
    enable_push: bool,
}

#[derive(Serialize)]
struct CreateHookRequest<'a> {
    #[serde(rename = "type")]
    hook_type: &'a str,
    config: CreateHookConfig<'a>,
    events: &'a [String],
    branch_filter: &'a str,
    active: bool,
}

#[derive(Serialize)]
struct CreateHookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
}

/// Thin client over the Gitea REST API (`/api/v1`).
pub struct GiteaClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl GiteaClient {
    pub fn new(client: ClientWithMiddleware, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
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
        error!("Gitea API error during {}: {} - {}", what, status, error_text);
        Err(anyhow!("Gitea API error during {}: {} - {}", what, status, error_text))
    }

    pub async fn add_collaborator(
        &self,
        repo: &RepoRef,
        username: &str,
        level: AccessLevel,
        token: &str,
    ) -> Result<()> {
        let url = self.api_url(&format!(
            "/repos/{}/{}/collaborators/{}",
            repo.owner, repo.name, username
        ));
        let response = self
            .client
            .put(&url)
            .header("Authorization", format!("token {}", token))
            .json(&AddCollaboratorRequest {
                permission: level.as_str(),
            })
            .send()
            .await
            .context("Failed to send add collaborator request")?;
        Self::check(response, "add collaborator").await?;
        Ok(())
    }

    /// Whether a protection rule exists for `branch`.
    pub async fn has_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<bool> {
        let url = self.api_url(&format!(
            "/repos/{}/{}/branch_protections/{}",
            repo.owner, repo.name, branch
        ));
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", token))
            .send()
            .await
            .context("Failed to send branch protection lookup")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "get branch protection").await?;
        Ok(true)
    }

    pub async fn create_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        let url = self.api_url(&format!(
            "/repos/{}/{}/branch_protections",
            repo.owner, repo.name
        ));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("token {}", token))
            .json(&CreateBranchProtectionRequest {
                branch_name: branch,
                rule_name: branch,
                enable_push: false,
            })
            .send()
            .await
            .context("Failed to send create branch protection request")?;
        Self::check(response, "create branch protection").await?;
        Ok(())
    }

    /// Delete the protection rule; a missing rule counts as success.
    pub async fn delete_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        let url = self.api_url(&format!(
            "/repos/{}/{}/branch_protections/{}",
            repo.owner, repo.name, branch
        ));
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("token {}", token))
            .send()
            .await
            .context("Failed to send delete branch protection request")?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No protection on {} in {}; nothing to remove", branch, repo);
            return Ok(());
        }
        Self::check(response, "delete branch protection").await?;
        Ok(())
    }

    async fn find_team_id(&self, org: &str, team_name: &str, token: &str) -> Result<Option<u64>> {
        for page in 1.. {
            let url = self.api_url(&format!(
                "/orgs/{}/teams?page={}&limit={}",
                org, page, PAGE_LIMIT
            ));
            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("token {}", token))
                .send()
                .await
                .context("Failed to send list teams request")?;
            let teams: Vec<Team> = Self::check(response, "list org teams")
                .await?
                .json()
                .await
                .context("Failed to parse teams response")?;

            let last_page = teams.len() < PAGE_LIMIT;
            if let Some(team) = teams.into_iter().find(|t| t.name == team_name) {
                return Ok(Some(team.id));
            }
            if last_page {
                break;
            }
        }
        Ok(None)
    }

    /// Whether `username` belongs to `team_name` in `org`. A missing team is `false`.
    pub async fn is_team_member(
        &self,
        org: &str,
        team_name: &str,
        username: &str,
        token: &str,
    ) -> Result<bool> {
        let Some(team_id) = self.find_team_id(org, team_name, token).await? else {
            debug!("Team {} not found in {}", team_name, org);
            return Ok(false);
        };

        let url = self.api_url(&format!("/teams/{}/members/{}", team_id, username));
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", token))
            .send()
            .await
            .context("Failed to send team member lookup")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "get team member").await?;
        Ok(true)
    }

    async fn list_hook_urls(&self, repo: &RepoRef, token: &str) -> Result<Vec<String>> {
        let url = self.api_url(&format!("/repos/{}/{}/hooks", repo.owner, repo.name));
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", token))
            .send()
            .await
            .context("Failed to send list hooks request")?;
        let hooks: Vec<Hook> = Self::check(response, "list repo hooks")
            .await?
            .json()
            .await
            .context("Failed to parse hooks response")?;
        Ok(hooks.into_iter().map(|h| h.config.url).collect())
    }

    pub async fn create_repo_hook(
        &self,
        repo: &RepoRef,
        registration: &WebhookRegistration,
        token: &str,
    ) -> Result<()> {
        let url = self.api_url(&format!("/repos/{}/{}/hooks", repo.owner, repo.name));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("token {}", token))
            .json(&CreateHookRequest {
                hook_type: "gitea",
                config: CreateHookConfig {
                    url: &registration.url,
                    content_type: "json",
                    secret: &registration.secret,
                },
                events: &registration.events,
                branch_filter: "*",
                active: true,
            })
            .send()
            .await
            .context("Failed to send create hook request")?;
        Self::check(response, "create repo hook").await?;
        Ok(())
    }
}

/// Repository permission operations the review lifecycle drives.
///
/// Callers treat every method as best-effort; see `interpreter::attempt`.
#[async_trait]
pub trait AccessController: Send + Sync {
    /// Set the student's collaborator permission. Uses the admin token.
    async fn set_collaborator_access(
        &self,
        repo: &RepoRef,
        username: &str,
        level: AccessLevel,
    ) -> Result<()>;

    async fn enable_branch_protection(&self, repo: &RepoRef, branch: &str, token: &str)
        -> Result<()>;

    async fn disable_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()>;

    async fn is_team_member(
        &self,
        org: &str,
        team_name: &str,
        username: &str,
        token: &str,
    ) -> Result<bool>;

    /// Install the review webhook unless one with the same URL exists.
    /// Returns whether a hook was created. Uses the admin token.
    async fn register_webhook(
        &self,
        repo: &RepoRef,
        registration: &WebhookRegistration,
    ) -> Result<bool>;
}

pub struct GiteaAccessController {
    client: GiteaClient,
    admin_token: Option<String>,
}

impl GiteaAccessController {
    pub fn new(client: GiteaClient, admin_token: Option<String>) -> Self {
        Self {
            client,
            admin_token,
        }
    }

    fn admin_token(&self) -> Result<&str> {
        self.admin_token
            .as_deref()
            .ok_or_else(|| anyhow!("GITEA_ADMIN_TOKEN is not configured"))
    }
}

#[async_trait]
impl AccessController for GiteaAccessController {
    async fn set_collaborator_access(
        &self,
        repo: &RepoRef,
        username: &str,
        level: AccessLevel,
    ) -> Result<()> {
        let token = self.admin_token()?;
        self.client
            .add_collaborator(repo, username, level, token)
            .await?;
        info!("Set {} access for {} on {}", level.as_str(), username, repo);
        Ok(())
    }

    async fn enable_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        if self.client.has_branch_protection(repo, branch, token).await? {
            debug!("{} in {} is already protected", branch, repo);
            return Ok(());
        }
        self.client
            .create_branch_protection(repo, branch, token)
            .await?;
        info!("Protected {} in {}", branch, repo);
        Ok(())
    }

    async fn disable_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        self.client
            .delete_branch_protection(repo, branch, token)
            .await?;
        info!("Unprotected {} in {}", branch, repo);
        Ok(())
    }

    async fn is_team_member(
        &self,
        org: &str,
        team_name: &str,
        username: &str,
        token: &str,
    ) -> Result<bool> {
        self.client
            .is_team_member(org, team_name, username, token)
            .await
    }

    async fn register_webhook(
        &self,
        repo: &RepoRef,
        registration: &WebhookRegistration,
    ) -> Result<bool> {
        let token = self.admin_token()?;
        let existing = self.client.list_hook_urls(repo, token).await?;
        if existing.iter().any(|url| url == &registration.url) {
            debug!("Webhook already registered on {}", repo);
            return Ok(false);
        }
        self.client.create_repo_hook(repo, registration, token).await?;
        info!("Registered review webhook on {}", repo);
        Ok(true)
    }
}
