//! Routes classified Gitea events to review engine operations.
//!
//! Anything that is a legitimate no-op from Gitea's side becomes a neutral
//! outcome. Only storage failures escape as errors.

use chrono::{DateTime, Utc};
use review_core::{
    is_feedback_thread, parse_comment, LedgerRowId, MagicCommand, ReviewRequestId, ReviewStatus,
    Submission,
};
use serde::Serialize;
use tracing::info;

use super::payload::{GiteaEvent, IssueCommentEvent, LegacyReviewed, PullRequestEvent};
use crate::engine::{InstructorCheck, ReviewEngine};
use crate::error::ReviewError;

/// Response body for every accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Ignored,
    NotPullRequest,
    NotFeedbackPr,
    NotReviewCommand,
    SubmissionNotFound,
    NotSubmissionOwner,
    ReviewAlreadyActive,
    ReviewRequested {
        review_request_id: ReviewRequestId,
        cancel_deadline: DateTime<Utc>,
    },
    NoPendingReview,
    ReviewAlreadySubmitted,
    ReviewCancelled {
        review_request_id: ReviewRequestId,
    },
    ReviewSubmittedImmediately {
        review_request_id: ReviewRequestId,
        ledger_row_id: Option<LedgerRowId>,
    },
    CommenterNotFound,
    Forbidden,
    NoReviewRequest,
    ForceCancelled {
        review_request_id: ReviewRequestId,
    },
    NoActiveReview,
    NoInstructor,
    ReviewerNotInstructor,
    Processed {
        review_request_id: ReviewRequestId,
    },
    InvalidRepository,
}

/// Statuses a force-cancel may act on.
const FORCE_CANCELLABLE: [ReviewStatus; 3] = [
    ReviewStatus::Pending,
    ReviewStatus::Submitted,
    ReviewStatus::Reviewed,
];

pub async fn dispatch(
    engine: &ReviewEngine,
    event: GiteaEvent,
) -> Result<WebhookOutcome, ReviewError> {
    match event {
        GiteaEvent::PullRequest(event) => handle_pull_request(engine, event).await,
        GiteaEvent::PullRequestReview(event) => handle_review_submitted(engine, event).await,
        GiteaEvent::IssueComment(event) => handle_issue_comment(engine, event).await,
        GiteaEvent::LegacyReviewed(event) => handle_legacy_reviewed(engine, event).await,
        GiteaEvent::Unsupported(kind) => {
            info!("Ignoring {} event", kind);
            Ok(WebhookOutcome::Ignored)
        }
    }
}

async fn handle_pull_request(
    engine: &ReviewEngine,
    event: PullRequestEvent,
) -> Result<WebhookOutcome, ReviewError> {
    if event.action != "review_requested" {
        return Ok(WebhookOutcome::Ignored);
    }
    if !is_feedback_thread(&event.pull_request.title) {
        info!("Review requested on non-feedback PR '{}'", event.pull_request.title);
        return Ok(WebhookOutcome::Ignored);
    }
    let Some(submission) = lookup_submission(engine, &event.repository.html_url).await? else {
        return Ok(WebhookOutcome::SubmissionNotFound);
    };
    request_review(engine, &submission, event.sender.name()).await
}

async fn handle_review_submitted(
    engine: &ReviewEngine,
    event: PullRequestEvent,
) -> Result<WebhookOutcome, ReviewError> {
    if event.action != "submitted" || !is_feedback_thread(&event.pull_request.title) {
        return Ok(WebhookOutcome::Ignored);
    }
    let Some(submission) = lookup_submission(engine, &event.repository.html_url).await? else {
        return Ok(WebhookOutcome::SubmissionNotFound);
    };
    let Some(review) = engine
        .latest_review(submission.id, &[ReviewStatus::Submitted])
        .await?
    else {
        return Ok(WebhookOutcome::NoActiveReview);
    };
    mark_reviewed(engine, &submission, review.id, event.sender.name(), false).await
}

async fn handle_legacy_reviewed(
    engine: &ReviewEngine,
    event: LegacyReviewed,
) -> Result<WebhookOutcome, ReviewError> {
    let Some(repo_url) = event.repo_url else {
        return Ok(WebhookOutcome::InvalidRepository);
    };
    let Some(submission) = lookup_submission(engine, &repo_url).await? else {
        return Ok(WebhookOutcome::SubmissionNotFound);
    };
    let Some(review) = engine
        .latest_review(submission.id, &ReviewStatus::ACTIVE)
        .await?
    else {
        return Ok(WebhookOutcome::NoActiveReview);
    };
    let Some(reviewer) = event.reviewer else {
        return Ok(WebhookOutcome::ReviewerNotInstructor);
    };
    mark_reviewed(engine, &submission, review.id, &reviewer, true).await
}

async fn handle_issue_comment(
    engine: &ReviewEngine,
    event: IssueCommentEvent,
) -> Result<WebhookOutcome, ReviewError> {
    if event.action != "created" {
        return Ok(WebhookOutcome::Ignored);
    }
    if !event.is_pull {
        return Ok(WebhookOutcome::NotPullRequest);
    }
    if !is_feedback_thread(&event.issue.title) {
        return Ok(WebhookOutcome::NotFeedbackPr);
    }
    let Some(command) = parse_comment(&event.comment.body) else {
        return Ok(WebhookOutcome::NotReviewCommand);
    };
    let Some(submission) = lookup_submission(engine, &event.repository.html_url).await? else {
        return Ok(WebhookOutcome::SubmissionNotFound);
    };

    let commenter = event.comment.user.name();
    info!("{} from {} on {}", command, commenter, submission.repo_url);

    match command {
        MagicCommand::ForceCancel => force_cancel(engine, &submission, commenter).await,
        _ if !submission.is_owned_by(commenter) => Ok(WebhookOutcome::NotSubmissionOwner),
        MagicCommand::RequestReview => request_review(engine, &submission, commenter).await,
        MagicCommand::CancelReview => cancel_review(engine, &submission, commenter).await,
        MagicCommand::SubmitNow => match engine.submit_immediately(submission.id, commenter).await
        {
            Ok(review) => Ok(WebhookOutcome::ReviewSubmittedImmediately {
                review_request_id: review.id,
                ledger_row_id: review.ledger_row_id,
            }),
            Err(ReviewError::Conflict(_)) => Ok(WebhookOutcome::ReviewAlreadyActive),
            Err(ReviewError::Forbidden(_)) => Ok(WebhookOutcome::NotSubmissionOwner),
            Err(ReviewError::NotFound(_)) => Ok(WebhookOutcome::SubmissionNotFound),
            Err(e) => Err(e),
        },
    }
}

async fn lookup_submission(
    engine: &ReviewEngine,
    repo_url: &str,
) -> Result<Option<Submission>, ReviewError> {
    let submission = engine.find_submission_by_repo_url(repo_url).await?;
    if submission.is_none() {
        info!("No submission for repository {}", repo_url);
    }
    Ok(submission)
}

async fn request_review(
    engine: &ReviewEngine,
    submission: &Submission,
    requester: &str,
) -> Result<WebhookOutcome, ReviewError> {
    match engine.request_review(submission.id, requester).await {
        Ok(outcome) => Ok(WebhookOutcome::ReviewRequested {
            review_request_id: outcome.review_request.id,
            cancel_deadline: outcome.cancel_deadline,
        }),
        Err(ReviewError::Conflict(_)) => Ok(WebhookOutcome::ReviewAlreadyActive),
        Err(ReviewError::Forbidden(_)) => Ok(WebhookOutcome::NotSubmissionOwner),
        Err(ReviewError::NotFound(_)) => Ok(WebhookOutcome::SubmissionNotFound),
        Err(e) => Err(e),
    }
}

async fn cancel_review(
    engine: &ReviewEngine,
    submission: &Submission,
    commenter: &str,
) -> Result<WebhookOutcome, ReviewError> {
    let Some(review) = engine
        .latest_review(submission.id, &[ReviewStatus::Pending])
        .await?
    else {
        return Ok(WebhookOutcome::NoPendingReview);
    };
    match engine.cancel_review(review.id, commenter).await {
        Ok(review) => Ok(WebhookOutcome::ReviewCancelled {
            review_request_id: review.id,
        }),
        Err(ReviewError::Expired(_)) => Ok(WebhookOutcome::ReviewAlreadySubmitted),
        Err(ReviewError::InvalidState(_)) | Err(ReviewError::NotFound(_)) => {
            Ok(WebhookOutcome::NoPendingReview)
        }
        Err(ReviewError::Forbidden(_)) => Ok(WebhookOutcome::NotSubmissionOwner),
        Err(e) => Err(e),
    }
}

async fn mark_reviewed(
    engine: &ReviewEngine,
    submission: &Submission,
    review_id: ReviewRequestId,
    reviewer: &str,
    allow_pending: bool,
) -> Result<WebhookOutcome, ReviewError> {
    let authorized = match engine.authorize_team_reviewer(reviewer, submission).await {
        InstructorCheck::Authorized(authorized) => authorized,
        InstructorCheck::NoCourseInstructor => return Ok(WebhookOutcome::NoInstructor),
        InstructorCheck::NotInstructor | InstructorCheck::UnknownUser => {
            return Ok(WebhookOutcome::ReviewerNotInstructor)
        }
    };
    match engine
        .mark_reviewed(review_id, &authorized, allow_pending)
        .await
    {
        Ok(review) => Ok(WebhookOutcome::Processed {
            review_request_id: review.id,
        }),
        Err(ReviewError::InvalidState(_)) | Err(ReviewError::NotFound(_)) => {
            Ok(WebhookOutcome::NoActiveReview)
        }
        Err(e) => Err(e),
    }
}

async fn force_cancel(
    engine: &ReviewEngine,
    submission: &Submission,
    commenter: &str,
) -> Result<WebhookOutcome, ReviewError> {
    let authorized = match engine.authorize_instructor(commenter, submission).await? {
        InstructorCheck::Authorized(authorized) => authorized,
        InstructorCheck::UnknownUser => return Ok(WebhookOutcome::CommenterNotFound),
        InstructorCheck::NotInstructor | InstructorCheck::NoCourseInstructor => {
            info!("{} tried to force-cancel without being an instructor", commenter);
            return Ok(WebhookOutcome::Forbidden);
        }
    };
    let Some(review) = engine
        .latest_review(submission.id, &FORCE_CANCELLABLE)
        .await?
    else {
        return Ok(WebhookOutcome::NoReviewRequest);
    };
    match engine.force_cancel(review.id, &authorized).await {
        Ok(review) => Ok(WebhookOutcome::ForceCancelled {
            review_request_id: review.id,
        }),
        Err(ReviewError::InvalidState(_)) | Err(ReviewError::NotFound(_)) => {
            Ok(WebhookOutcome::NoReviewRequest)
        }
        Err(e) => Err(e),
    }
}
