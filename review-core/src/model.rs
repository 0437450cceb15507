//! Records shared by the review engine and its collaborators.
//!
//! `ReviewRequest` is the only record owned by this crate. Submissions, users and
//! courses belong to the roster and are read here, never written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(id: $inner) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a review request, assigned by storage on creation.
    ReviewRequestId(u64)
);
numeric_id!(
    /// Identifier of a student's submission (roster-owned).
    SubmissionId(u64)
);
numeric_id!(UserId(u64));
numeric_id!(CourseId(u64));
numeric_id!(
    /// 1-based row index in the external ledger.
    LedgerRowId(u32)
);

/// Lifecycle status of a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// Inside (or just past) the cancellation window.
    Pending,
    /// Window closed; the request is queued for an instructor.
    Submitted,
    /// An instructor closed the loop. Terminal.
    Reviewed,
    /// Withdrawn by the student or force-cancelled. Terminal.
    Cancelled,
}

impl ReviewStatus {
    /// Statuses that count towards the one-active-request-per-submission rule.
    pub const ACTIVE: [ReviewStatus; 2] = [ReviewStatus::Pending, ReviewStatus::Submitted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Reviewed => "reviewed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Submitted)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown review status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ReviewStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "reviewed" => Ok(Self::Reviewed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The durable review request record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: ReviewRequestId,
    pub submission_id: SubmissionId,
    pub status: ReviewStatus,
    pub requested_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub ledger_row_id: Option<LedgerRowId>,
}

/// Fields supplied by the engine when creating a review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReviewRequest {
    pub submission_id: SubmissionId,
    pub requested_at: DateTime<Utc>,
}

impl NewReviewRequest {
    /// Materialise the record once storage has assigned an id.
    pub fn into_request(self, id: ReviewRequestId) -> ReviewRequest {
        ReviewRequest {
            id,
            submission_id: self.submission_id,
            status: ReviewStatus::Pending,
            requested_at: self.requested_at,
            submitted_at: None,
            reviewed_at: None,
            ledger_row_id: None,
        }
    }
}

/// Permission level of a collaborator on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Status label written into the ledger's status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStatus {
    AwaitingReview,
    Reviewed,
}

impl LedgerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AwaitingReview => "Ожидает review",
            Self::Reviewed => "Проверено",
        }
    }
}

/// Owner/name pair addressing a repository on the Git host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A roster user (instructor or student account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    /// Delegated Git-host token. Never serialised.
    #[serde(skip)]
    pub access_token: Option<String>,
}

/// The student a submission belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub username: String,
    pub full_name: String,
}

impl Student {
    /// Name shown in the ledger; falls back to the username when no full name is on record.
    pub fn display_name(&self) -> &str {
        if self.full_name.trim().is_empty() {
            &self.username
        } else {
            &self.full_name
        }
    }
}

/// A submission joined with the course data the engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub course_id: CourseId,
    pub course_slug: String,
    pub org_name: String,
    pub academic_year: i32,
    pub repo_url: String,
    pub student: Student,
}

impl Submission {
    /// Repository name: the last path segment of the repository URL.
    pub fn repo_name(&self) -> &str {
        self.repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    pub fn repo_ref(&self) -> RepoRef {
        RepoRef {
            owner: self.org_name.clone(),
            name: self.repo_name().to_string(),
        }
    }

    pub fn instructor_team_name(&self) -> String {
        format!("{}-{}-instructors", self.academic_year, self.course_slug)
    }

    pub fn is_owned_by(&self, username: &str) -> bool {
        self.student.username == username
    }
}
