//! In-memory implementation of `ReviewRepository`.
//!
//! Holds roster and review data in `RwLock`-protected maps; everything is lost on
//! restart. Used by tests and by deployments that run without a database.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use review_core::{
    CourseId, NewReviewRequest, ReviewRequest, ReviewRequestId, ReviewStatus, Submission,
    SubmissionId, User, UserId,
};
use tokio::sync::RwLock;

use super::{RepositoryError, ReviewRepository};

#[derive(Default)]
struct Reviews {
    next_id: u64,
    by_id: BTreeMap<ReviewRequestId, ReviewRequest>,
}

#[derive(Default)]
struct Roster {
    users: HashMap<UserId, User>,
    submissions: HashMap<SubmissionId, Submission>,
    instructors: HashSet<(CourseId, UserId)>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    reviews: RwLock<Reviews>,
    roster: RwLock<Roster>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.roster.write().await.users.insert(user.id, user);
    }

    pub async fn insert_submission(&self, submission: Submission) {
        self.roster
            .write()
            .await
            .submissions
            .insert(submission.id, submission);
    }

    pub async fn add_course_instructor(&self, course_id: CourseId, user_id: UserId) {
        self.roster
            .write()
            .await
            .instructors
            .insert((course_id, user_id));
    }
}

/// Newest first: later `requested_at`, then higher id.
fn newest_first(a: &ReviewRequest, b: &ReviewRequest) -> std::cmp::Ordering {
    b.requested_at
        .cmp(&a.requested_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[async_trait]
impl ReviewRepository for InMemoryRepository {
    async fn get_review(
        &self,
        id: ReviewRequestId,
    ) -> Result<Option<ReviewRequest>, RepositoryError> {
        Ok(self.reviews.read().await.by_id.get(&id).cloned())
    }

    async fn find_reviews(
        &self,
        submission_id: SubmissionId,
        statuses: &[ReviewStatus],
    ) -> Result<Vec<ReviewRequest>, RepositoryError> {
        let reviews = self.reviews.read().await;
        let mut found: Vec<ReviewRequest> = reviews
            .by_id
            .values()
            .filter(|r| r.submission_id == submission_id && statuses.contains(&r.status))
            .cloned()
            .collect();
        found.sort_by(newest_first);
        Ok(found)
    }

    async fn list_reviews_with_status(
        &self,
        status: ReviewStatus,
    ) -> Result<Vec<ReviewRequest>, RepositoryError> {
        let reviews = self.reviews.read().await;
        Ok(reviews
            .by_id
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn create_review(
        &self,
        new: NewReviewRequest,
    ) -> Result<ReviewRequest, RepositoryError> {
        let mut reviews = self.reviews.write().await;
        let conflict = reviews
            .by_id
            .values()
            .any(|r| r.submission_id == new.submission_id && r.status.is_active());
        if conflict {
            return Err(RepositoryError::ActiveReviewExists(new.submission_id));
        }

        reviews.next_id += 1;
        let request = new.into_request(ReviewRequestId(reviews.next_id));
        reviews.by_id.insert(request.id, request.clone());
        Ok(request)
    }

    async fn save_review(&self, review: &ReviewRequest) -> Result<(), RepositoryError> {
        let mut reviews = self.reviews.write().await;
        if review.status.is_active() {
            let conflict = reviews.by_id.values().any(|r| {
                r.id != review.id && r.submission_id == review.submission_id && r.status.is_active()
            });
            if conflict {
                return Err(RepositoryError::ActiveReviewExists(review.submission_id));
            }
        }
        match reviews.by_id.get_mut(&review.id) {
            Some(existing) => {
                *existing = review.clone();
                Ok(())
            }
            None => Err(RepositoryError::ReviewNotFound(review.id)),
        }
    }

    async fn get_submission(
        &self,
        id: SubmissionId,
    ) -> Result<Option<Submission>, RepositoryError> {
        Ok(self.roster.read().await.submissions.get(&id).cloned())
    }

    async fn find_submission_by_repo_url(
        &self,
        repo_url: &str,
    ) -> Result<Option<Submission>, RepositoryError> {
        let roster = self.roster.read().await;
        Ok(roster
            .submissions
            .values()
            .find(|s| s.repo_url == repo_url)
            .cloned())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.roster.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, RepositoryError> {
        let roster = self.roster.read().await;
        Ok(roster
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn is_course_instructor(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .roster
            .read()
            .await
            .instructors
            .contains(&(course_id, user_id)))
    }

    async fn find_course_instructor(
        &self,
        course_id: CourseId,
    ) -> Result<Option<User>, RepositoryError> {
        let roster = self.roster.read().await;
        let mut instructors: Vec<&User> = roster
            .instructors
            .iter()
            .filter(|(course, _)| *course == course_id)
            .filter_map(|(_, user_id)| roster.users.get(user_id))
            .collect();
        // Prefer someone who can act on Gitea, then the lowest id for stability.
        instructors.sort_by_key(|u| (u.access_token.is_none(), u.id));
        Ok(instructors.first().map(|u| (*u).clone()))
    }
}
