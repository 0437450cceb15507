//! Effect interpreter: runs state-machine effects against Gitea and the ledger.
//!
//! Every external call goes through [`attempt`]. A failure is logged and the
//! effect produces no result event; it never aborts the transition that caused
//! it, because the stored status is authoritative.

use std::future::Future;
use std::sync::Arc;

use review_core::{Effect, Event, RepoRef, Submission};
use tracing::{debug, info, warn};

use crate::gitea::AccessController;
use crate::ledger::{Ledger, LedgerRow};

/// Await a fallible external call; log and swallow its error.
pub async fn attempt<T, F>(operation: &str, fut: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed (continuing): {:#}", operation, e);
            None
        }
    }
}

/// What the interpreter needs to know about the request it acts on.
pub struct EffectContext {
    pub submission: Submission,
    /// Delegated token of a course instructor, used for branch protection.
    pub instructor_token: Option<String>,
}

impl EffectContext {
    fn repo(&self) -> RepoRef {
        self.submission.repo_ref()
    }
}

pub struct EffectInterpreter {
    access: Arc<dyn AccessController>,
    ledger: Option<Arc<dyn Ledger>>,
    protected_branch: String,
}

impl EffectInterpreter {
    pub fn new(
        access: Arc<dyn AccessController>,
        ledger: Option<Arc<dyn Ledger>>,
        protected_branch: impl Into<String>,
    ) -> Self {
        Self {
            access,
            ledger,
            protected_branch: protected_branch.into(),
        }
    }

    /// Execute effects in order and collect the events they produce.
    pub async fn execute(&self, ctx: &EffectContext, effects: Vec<Effect>) -> Vec<Event> {
        let mut result_events = Vec::new();
        for effect in effects {
            if let Some(event) = self.execute_effect(ctx, effect).await {
                result_events.push(event);
            }
        }
        result_events
    }

    async fn execute_effect(&self, ctx: &EffectContext, effect: Effect) -> Option<Event> {
        let repo = ctx.repo();
        match effect {
            Effect::SetCollaboratorAccess { level } => {
                attempt(
                    "set collaborator access",
                    self.access.set_collaborator_access(
                        &repo,
                        &ctx.submission.student.username,
                        level,
                    ),
                )
                .await;
                None
            }

            Effect::EnableBranchProtection => {
                let Some(token) = ctx.instructor_token.as_deref() else {
                    warn!("No instructor token for {}; cannot protect branch", repo);
                    return None;
                };
                attempt(
                    "enable branch protection",
                    self.access
                        .enable_branch_protection(&repo, &self.protected_branch, token),
                )
                .await;
                None
            }

            Effect::DisableBranchProtection => {
                let Some(token) = ctx.instructor_token.as_deref() else {
                    warn!("No instructor token for {}; cannot unprotect branch", repo);
                    return None;
                };
                attempt(
                    "disable branch protection",
                    self.access
                        .disable_branch_protection(&repo, &self.protected_branch, token),
                )
                .await;
                None
            }

            Effect::AppendLedgerRow { requested_at } => {
                let Some(ledger) = &self.ledger else {
                    debug!("Ledger disabled; not appending row for {}", repo);
                    return None;
                };
                let row = LedgerRow {
                    full_name: ctx.submission.student.display_name().to_string(),
                    repo_url: ctx.submission.repo_url.clone(),
                    requested_at,
                };
                let row = attempt("append ledger row", ledger.append_review_request(&row)).await?;
                info!("Ledger row {} appended for {}", row, repo);
                Some(Event::LedgerRowAppended { row })
            }

            Effect::UpdateLedgerStatus { row, status } => {
                if let Some(ledger) = &self.ledger {
                    attempt("update ledger row", ledger.update_row_status(row, status)).await;
                }
                None
            }

            Effect::DeleteLedgerRow { row } => {
                if let Some(ledger) = &self.ledger {
                    attempt("delete ledger row", ledger.delete_row(row)).await;
                }
                None
            }
        }
    }
}
