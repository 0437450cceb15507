//! Persistence collaborator for the review engine.
//!
//! The engine owns `review_requests`; everything else (users, courses, rosters,
//! submissions) is read-only here. Implementations are injected as
//! `Arc<dyn ReviewRepository>`.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use review_core::{
    CourseId, NewReviewRequest, ReviewRequest, ReviewRequestId, ReviewStatus, Submission,
    SubmissionId, User, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("submission {0} already has an active review request")]
    ActiveReviewExists(SubmissionId),

    #[error("review request {0} not found")]
    ReviewNotFound(ReviewRequestId),

    #[error("corrupt {0} in database")]
    Corruption(&'static str),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        Self::Corruption(what)
    }
}

/// Storage operations the review engine needs.
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    async fn get_review(&self, id: ReviewRequestId)
        -> Result<Option<ReviewRequest>, RepositoryError>;

    /// Requests for a submission whose status is one of `statuses`, newest first.
    async fn find_reviews(
        &self,
        submission_id: SubmissionId,
        statuses: &[ReviewStatus],
    ) -> Result<Vec<ReviewRequest>, RepositoryError>;

    /// Every request currently in `status`, oldest first.
    async fn list_reviews_with_status(
        &self,
        status: ReviewStatus,
    ) -> Result<Vec<ReviewRequest>, RepositoryError>;

    /// Insert a new `Pending` request.
    ///
    /// Fails with `ActiveReviewExists` when the submission already has a
    /// `Pending` or `Submitted` request.
    async fn create_review(&self, new: NewReviewRequest)
        -> Result<ReviewRequest, RepositoryError>;

    /// Overwrite an existing request.
    async fn save_review(&self, review: &ReviewRequest) -> Result<(), RepositoryError>;

    async fn get_submission(&self, id: SubmissionId)
        -> Result<Option<Submission>, RepositoryError>;

    async fn find_submission_by_repo_url(
        &self,
        repo_url: &str,
    ) -> Result<Option<Submission>, RepositoryError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError>;

    async fn find_user_by_username(&self, username: &str)
        -> Result<Option<User>, RepositoryError>;

    async fn is_course_instructor(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<bool, RepositoryError>;

    /// Any instructor of the course; their delegated token drives branch protection.
    async fn find_course_instructor(
        &self,
        course_id: CourseId,
    ) -> Result<Option<User>, RepositoryError>;
}
