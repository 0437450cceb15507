//! The review engine.
//!
//! Owns the pending-window cache and drives review requests through the pure
//! state machine. Each operation loads the record, applies one event, persists the
//! result, then interprets the effects. Events produced by effects (an appended
//! ledger row) are fed back through the same loop.
//!
//! Storage failures abort an operation. Gitea and ledger failures never do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use review_core::{
    lock_effects, transition, Effect, Event, NewReviewRequest, PendingReviewCache, ReviewRequest,
    ReviewRequestId, ReviewStatus, Submission, SubmissionId, TransitionResult, User, UserId,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::ReviewError;
use crate::gitea::{AccessController, WebhookRegistration};
use crate::interpreter::{attempt, EffectContext, EffectInterpreter};
use crate::ledger::Ledger;
use crate::persistence::ReviewRepository;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a student may cancel a fresh request.
    pub pending_window: Duration,
    /// Branch locked while a request is under review.
    pub protected_branch: String,
    /// Repository webhook installed on first request, when configured.
    pub webhook: Option<WebhookRegistration>,
}

/// Result of opening a review request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub review_request: ReviewRequest,
    pub cancel_deadline: DateTime<Utc>,
    pub seconds_to_cancel: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Submitted(ReviewRequest),
    /// The request had already left `Pending`.
    Skipped(ReviewStatus),
    Missing,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewStatusView {
    pub has_active_request: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_request: Option<ReviewRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_cancel: Option<bool>,
}

/// Proof that a user was checked as an instructor for one submission.
///
/// Only the engine's authorization methods construct it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedInstructor {
    username: String,
    submission_id: SubmissionId,
}

impl AuthorizedInstructor {
    pub fn username(&self) -> &str {
        &self.username
    }

    fn ensure_covers(&self, submission_id: SubmissionId) -> Result<(), ReviewError> {
        if self.submission_id != submission_id {
            return Err(ReviewError::Forbidden(format!(
                "{} is not authorized for submission {}",
                self.username, submission_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructorCheck {
    Authorized(AuthorizedInstructor),
    UnknownUser,
    NotInstructor,
    /// Nobody with a Gitea token teaches the course, so membership cannot be checked.
    NoCourseInstructor,
}

pub struct ReviewEngine {
    repository: Arc<dyn ReviewRepository>,
    access: Arc<dyn AccessController>,
    interpreter: EffectInterpreter,
    cache: PendingReviewCache,
    settings: EngineSettings,
    /// Serialises the active-request check with the insert that follows it.
    creation_lock: Mutex<()>,
    /// Held from the read to the write of every status transition.
    transition_lock: Mutex<()>,
}

impl ReviewEngine {
    pub fn new(
        repository: Arc<dyn ReviewRepository>,
        access: Arc<dyn AccessController>,
        ledger: Option<Arc<dyn Ledger>>,
        settings: EngineSettings,
    ) -> Self {
        let interpreter =
            EffectInterpreter::new(access.clone(), ledger, settings.protected_branch.clone());
        Self {
            repository,
            access,
            interpreter,
            cache: PendingReviewCache::new(),
            settings,
            creation_lock: Mutex::new(()),
            transition_lock: Mutex::new(()),
        }
    }

    pub fn pending_cache(&self) -> &PendingReviewCache {
        &self.cache
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Student operations
    // =========================================================================

    /// Open a review request and lock the repository.
    pub async fn request_review(
        &self,
        submission_id: SubmissionId,
        requested_by: &str,
    ) -> Result<RequestOutcome, ReviewError> {
        let submission = self.owned_submission(submission_id, requested_by).await?;
        let review = self.open_request(&submission).await?;
        let ctx = self.effect_context(submission).await;
        self.lock_repository(&review, &ctx).await;

        Ok(RequestOutcome {
            cancel_deadline: self.window_end(review.requested_at)?,
            seconds_to_cancel: self.settings.pending_window.as_secs(),
            review_request: review,
        })
    }

    /// Withdraw a request while its cancellation window is open.
    pub async fn cancel_review(
        &self,
        id: ReviewRequestId,
        requested_by: &str,
    ) -> Result<ReviewRequest, ReviewError> {
        let review = self.load_review(id).await?;
        let submission = self.submission_for(&review).await?;
        if !submission.is_owned_by(requested_by) {
            return Err(ReviewError::Forbidden(
                "only the student who owns the submission can cancel its review".to_string(),
            ));
        }
        if review.status != ReviewStatus::Pending {
            return Err(ReviewError::InvalidState(format!(
                "review request {} is {}; only pending requests can be cancelled",
                id, review.status
            )));
        }

        // Claiming the entry is what excludes the reconciliation worker.
        let Some(entry) = self.cache.claim_live(id).await else {
            return Err(ReviewError::Expired(format!(
                "the cancellation window for review request {} has closed",
                id
            )));
        };

        let TransitionResult { request, effects } =
            match self.commit(id, Event::CancelRequested).await {
                Ok(result) => result,
                // An instructor moved it on after our read; the window is moot.
                Err(e @ ReviewError::InvalidState(_)) => return Err(e),
                Err(e) => {
                    self.cache.reinsert(entry).await;
                    return Err(e);
                }
            };

        let ctx = self.effect_context(submission).await;
        Ok(self.settle(request, effects, &ctx).await)
    }

    /// Open a request and close its window at once.
    pub async fn submit_immediately(
        &self,
        submission_id: SubmissionId,
        requested_by: &str,
    ) -> Result<ReviewRequest, ReviewError> {
        let submission = self.owned_submission(submission_id, requested_by).await?;
        let review = self.open_request(&submission).await?;
        let ctx = self.effect_context(submission).await;
        self.lock_repository(&review, &ctx).await;

        if !self.cache.remove(review.id).await {
            // A cancel got there first.
            return self.load_review(review.id).await;
        }
        match self.finalize_expired(review.id).await? {
            FinalizeOutcome::Submitted(request) => Ok(request),
            FinalizeOutcome::Skipped(_) | FinalizeOutcome::Missing => {
                self.load_review(review.id).await
            }
        }
    }

    // =========================================================================
    // Worker operations
    // =========================================================================

    /// Move a request whose window closed to `Submitted` and append its ledger row.
    ///
    /// The caller must already have claimed the cache entry.
    pub async fn finalize_expired(
        &self,
        id: ReviewRequestId,
    ) -> Result<FinalizeOutcome, ReviewError> {
        let Some(review) = self.repository.get_review(id).await? else {
            warn!("Review request {} vanished before finalization", id);
            return Ok(FinalizeOutcome::Missing);
        };
        if review.status != ReviewStatus::Pending {
            debug!(
                "Review request {} is already {}; nothing to finalize",
                id, review.status
            );
            return Ok(FinalizeOutcome::Skipped(review.status));
        }

        let submission = self.submission_for(&review).await?;
        let TransitionResult { request, effects } =
            match self.commit(id, Event::WindowClosed { at: Utc::now() }).await {
                Ok(result) => result,
                Err(ReviewError::InvalidState(_)) => {
                    let status = self.load_review(id).await?.status;
                    info!(
                        "Review request {} became {} before its window was closed",
                        id, status
                    );
                    return Ok(FinalizeOutcome::Skipped(status));
                }
                Err(e) => return Err(e),
            };
        let ctx = self.effect_context(submission).await;
        Ok(FinalizeOutcome::Submitted(
            self.settle(request, effects, &ctx).await,
        ))
    }

    /// Recreate cache entries for `Pending` records that have none.
    ///
    /// Each entry gets what is left of its original window, floored at zero, so an
    /// already elapsed window is finalized by the next sweep.
    pub async fn restore_pending_windows(&self) -> Result<usize, ReviewError> {
        let pending = self
            .repository
            .list_reviews_with_status(ReviewStatus::Pending)
            .await?;
        let now = Utc::now();
        let mut restored = 0;

        for review in pending {
            if self.cache.get(review.id).await.is_some() {
                continue;
            }
            let remaining = self
                .window_end(review.requested_at)
                .ok()
                .and_then(|end| (end - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.cache
                .add(review.id, review.submission_id, remaining)
                .await;
            info!(
                "Restored pending window for review request {} ({}s left)",
                review.id,
                remaining.as_secs()
            );
            restored += 1;
        }

        Ok(restored)
    }

    // =========================================================================
    // Instructor operations
    // =========================================================================

    /// Close the loop on a request. `allow_pending` is the instructor override
    /// that skips the submitted stage.
    pub async fn mark_reviewed(
        &self,
        id: ReviewRequestId,
        by: &AuthorizedInstructor,
        allow_pending: bool,
    ) -> Result<ReviewRequest, ReviewError> {
        let review = self.load_review(id).await?;
        by.ensure_covers(review.submission_id)?;
        let submission = self.submission_for(&review).await?;

        if allow_pending
            && !self.cache.remove(id).await
            && review.status == ReviewStatus::Pending
        {
            debug!("Window of review request {} already claimed by the worker", id);
        }

        let TransitionResult { request, effects } = self
            .commit(
                id,
                Event::ReviewSubmitted {
                    at: Utc::now(),
                    allow_pending,
                },
            )
            .await?;
        info!("Review request {} marked reviewed by {}", id, by.username());

        let ctx = self.effect_context(submission).await;
        Ok(self.settle(request, effects, &ctx).await)
    }

    /// Cancel a request in any status except `Cancelled`.
    pub async fn force_cancel(
        &self,
        id: ReviewRequestId,
        by: &AuthorizedInstructor,
    ) -> Result<ReviewRequest, ReviewError> {
        let review = self.load_review(id).await?;
        by.ensure_covers(review.submission_id)?;
        let submission = self.submission_for(&review).await?;

        if self.cache.remove(id).await {
            debug!("Dropped pending window of review request {}", id);
        }

        let TransitionResult { request, effects } =
            self.commit(id, Event::ForceCancelRequested).await?;
        info!("Review request {} force-cancelled by {}", id, by.username());

        let ctx = self.effect_context(submission).await;
        Ok(self.settle(request, effects, &ctx).await)
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// Check a username against the course's instructor roster.
    pub async fn authorize_instructor(
        &self,
        username: &str,
        submission: &Submission,
    ) -> Result<InstructorCheck, ReviewError> {
        let Some(user) = self.repository.find_user_by_username(username).await? else {
            return Ok(InstructorCheck::UnknownUser);
        };
        Ok(match self.authorize_user(&user, submission).await? {
            Some(authorized) => InstructorCheck::Authorized(authorized),
            None => InstructorCheck::NotInstructor,
        })
    }

    pub async fn authorize_user(
        &self,
        user: &User,
        submission: &Submission,
    ) -> Result<Option<AuthorizedInstructor>, ReviewError> {
        if !self
            .repository
            .is_course_instructor(user.id, submission.course_id)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(AuthorizedInstructor {
            username: user.username.clone(),
            submission_id: submission.id,
        }))
    }

    /// Check Gitea instructor-team membership. Any lookup failure is a denial.
    pub async fn authorize_team_reviewer(
        &self,
        username: &str,
        submission: &Submission,
    ) -> InstructorCheck {
        let Some(token) = self.instructor_token(submission).await else {
            warn!(
                "No instructor token for course {}; cannot verify reviewer {}",
                submission.course_id, username
            );
            return InstructorCheck::NoCourseInstructor;
        };
        let team = submission.instructor_team_name();
        let is_member = attempt(
            "instructor team lookup",
            self.access
                .is_team_member(&submission.org_name, &team, username, &token),
        )
        .await
        .unwrap_or(false);

        if !is_member {
            info!("{} is not a member of {}/{}", username, submission.org_name, team);
            return InstructorCheck::NotInstructor;
        }
        InstructorCheck::Authorized(AuthorizedInstructor {
            username: username.to_string(),
            submission_id: submission.id,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn review_status(
        &self,
        submission_id: SubmissionId,
    ) -> Result<ReviewStatusView, ReviewError> {
        let Some(review) = self
            .latest_review(submission_id, &ReviewStatus::ACTIVE)
            .await?
        else {
            return Ok(ReviewStatusView {
                has_active_request: false,
                review_request: None,
                seconds_remaining: None,
                can_cancel: None,
            });
        };

        let (seconds_remaining, can_cancel) = if review.status == ReviewStatus::Pending {
            (
                Some(self.cache.time_remaining(review.id).await.as_secs()),
                Some(self.cache.exists(review.id).await),
            )
        } else {
            (None, None)
        };

        Ok(ReviewStatusView {
            has_active_request: true,
            review_request: Some(review),
            seconds_remaining,
            can_cancel,
        })
    }

    /// Newest request of the submission in one of `statuses`.
    pub async fn latest_review(
        &self,
        submission_id: SubmissionId,
        statuses: &[ReviewStatus],
    ) -> Result<Option<ReviewRequest>, ReviewError> {
        Ok(self
            .repository
            .find_reviews(submission_id, statuses)
            .await?
            .into_iter()
            .next())
    }

    pub async fn review(&self, id: ReviewRequestId) -> Result<Option<ReviewRequest>, ReviewError> {
        Ok(self.repository.get_review(id).await?)
    }

    pub async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>, ReviewError> {
        Ok(self.repository.get_submission(id).await?)
    }

    pub async fn find_submission_by_repo_url(
        &self,
        repo_url: &str,
    ) -> Result<Option<Submission>, ReviewError> {
        Ok(self.repository.find_submission_by_repo_url(repo_url).await?)
    }

    pub async fn user(&self, id: UserId) -> Result<Option<User>, ReviewError> {
        Ok(self.repository.get_user(id).await?)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn owned_submission(
        &self,
        submission_id: SubmissionId,
        username: &str,
    ) -> Result<Submission, ReviewError> {
        let submission = self
            .repository
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| {
                ReviewError::NotFound(format!("submission {} not found", submission_id))
            })?;
        if !submission.is_owned_by(username) {
            return Err(ReviewError::Forbidden(
                "only the student who owns the submission can request a review".to_string(),
            ));
        }
        Ok(submission)
    }

    async fn load_review(&self, id: ReviewRequestId) -> Result<ReviewRequest, ReviewError> {
        self.repository
            .get_review(id)
            .await?
            .ok_or_else(|| ReviewError::NotFound(format!("review request {} not found", id)))
    }

    async fn submission_for(&self, review: &ReviewRequest) -> Result<Submission, ReviewError> {
        self.repository
            .get_submission(review.submission_id)
            .await?
            .ok_or_else(|| {
                ReviewError::NotFound(format!("submission {} not found", review.submission_id))
            })
    }

    /// Check for an active request and insert a new one, then open its window.
    async fn open_request(&self, submission: &Submission) -> Result<ReviewRequest, ReviewError> {
        let _guard = self.creation_lock.lock().await;

        if let Some(existing) = self
            .latest_review(submission.id, &ReviewStatus::ACTIVE)
            .await?
        {
            info!(
                "Submission {} already has active review request {} ({})",
                submission.id, existing.id, existing.status
            );
            return Err(ReviewError::Conflict(format!(
                "submission {} already has an active review request",
                submission.id
            )));
        }

        let review = self
            .repository
            .create_review(NewReviewRequest {
                submission_id: submission.id,
                requested_at: Utc::now(),
            })
            .await?;
        self.cache
            .add(review.id, submission.id, self.settings.pending_window)
            .await;

        info!(
            "Opened review request {} for submission {} ({})",
            review.id, submission.id, submission.repo_url
        );
        Ok(review)
    }

    async fn lock_repository(&self, review: &ReviewRequest, ctx: &EffectContext) {
        self.settle(review.clone(), lock_effects(), ctx).await;

        if let Some(registration) = &self.settings.webhook {
            attempt(
                "register repository webhook",
                self.access
                    .register_webhook(&ctx.submission.repo_ref(), registration),
            )
            .await;
        }
    }

    /// Apply an event to the stored record and persist the result.
    ///
    /// The read and the write happen under one lock, so a transition is never
    /// computed from a record another caller has since replaced. Effects are
    /// returned unexecuted.
    async fn commit(
        &self,
        id: ReviewRequestId,
        event: Event,
    ) -> Result<TransitionResult, ReviewError> {
        let _guard = self.transition_lock.lock().await;

        let review = self.load_review(id).await?;
        let summary = event.log_summary();
        let result = transition(&review, event)?;
        self.repository.save_review(&result.request).await?;
        info!(
            "Review request {}: {} -> {} ({})",
            id, review.status, result.request.status, summary
        );
        Ok(result)
    }

    /// Execute effects and process the events they produce.
    ///
    /// The stored record is authoritative from here on: failures are logged and
    /// the last successfully saved record is returned.
    async fn settle(
        &self,
        mut current: ReviewRequest,
        effects: Vec<Effect>,
        ctx: &EffectContext,
    ) -> ReviewRequest {
        let mut events_to_process = Vec::new();
        if !effects.is_empty() {
            info!(
                "Executing {} effects for review request {}",
                effects.len(),
                current.id
            );
            let result_events = self.interpreter.execute(ctx, effects).await;
            events_to_process.extend(result_events.into_iter().rev());
        }

        while let Some(event) = events_to_process.pop() {
            info!(
                "Processing event {} for review request {}",
                event.log_summary(),
                current.id
            );
            // Effects run unlocked; commit applies the event to whatever is stored now.
            let TransitionResult { request, effects } = match self.commit(current.id, event).await
            {
                Ok(result) => result,
                Err(ReviewError::InvalidState(reason)) => {
                    warn!("Dropping event for review request {}: {}", current.id, reason);
                    if let Ok(latest) = self.load_review(current.id).await {
                        current = latest;
                    }
                    continue;
                }
                Err(e) => {
                    error!("Failed to apply event to review request {}: {}", current.id, e);
                    break;
                }
            };
            current = request;

            if !effects.is_empty() {
                let result_events = self.interpreter.execute(ctx, effects).await;
                events_to_process.extend(result_events.into_iter().rev());
            }
        }

        current
    }

    async fn effect_context(&self, submission: Submission) -> EffectContext {
        let instructor_token = self.instructor_token(&submission).await;
        EffectContext {
            submission,
            instructor_token,
        }
    }

    /// Delegated token of one of the course's instructors.
    async fn instructor_token(&self, submission: &Submission) -> Option<String> {
        match self
            .repository
            .find_course_instructor(submission.course_id)
            .await
        {
            Ok(Some(user)) => user.access_token,
            Ok(None) => {
                warn!("Course {} has no instructor", submission.course_id);
                None
            }
            Err(e) => {
                warn!(
                    "Failed to look up instructor for course {}: {}",
                    submission.course_id, e
                );
                None
            }
        }
    }

    fn window_end(&self, requested_at: DateTime<Utc>) -> Result<DateTime<Utc>, ReviewError> {
        chrono::Duration::from_std(self.settings.pending_window)
            .ok()
            .and_then(|window| requested_at.checked_add_signed(window))
            .ok_or_else(|| ReviewError::Internal("pending window is out of range".to_string()))
    }
}
