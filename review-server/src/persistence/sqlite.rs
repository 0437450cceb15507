//! SQLite implementation of `ReviewRepository`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table. To change the schema, increment
//! `CURRENT_SCHEMA_VERSION` and add a step to `run_migrations()`; steps run in
//! order from the stored version to the current one.
//!
//! # Ownership
//!
//! The roster tables (`users`, `courses`, `course_instructors`, `students`,
//! `assignments`, `submissions`) are maintained by the course administration
//! tooling and only read here. `review_requests` is written only by the engine.


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use review_core::{
    CourseId, LedgerRowId, NewReviewRequest, ReviewRequest, ReviewRequestId, ReviewStatus,
    Student, Submission, SubmissionId, User, UserId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::warn;

use super::{RepositoryError, ReviewRepository};

const CURRENT_SCHEMA_VERSION: i64 = 2;

const REVIEW_COLUMNS: &str =
    "id, submission_id, status, requested_at, submitted_at, reviewed_at, ledger_row_id";

const SUBMISSION_SELECT: &str = "SELECT s.id, c.id, c.slug, c.org_name, c.academic_year,
            s.repo_url, st.username, st.full_name
     FROM submissions s
     JOIN assignments a ON a.id = s.assignment_id
     JOIN courses c ON c.id = a.course_id
     JOIN students st ON st.id = s.student_id";

/// SQLite-backed repository.
///
/// rusqlite is synchronous, so every call runs on `spawn_blocking` against a single
/// shared connection.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The connection runs in WAL mode with `synchronous = FULL`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // The database holds delegated Gitea tokens.
        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the filesystem may not support shared memory",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a fresh in-memory database.
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // v1: roster tables and review requests.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    full_name TEXT NOT NULL DEFAULT '',
                    access_token TEXT
                );

                CREATE TABLE IF NOT EXISTS courses (
                    id INTEGER PRIMARY KEY,
                    slug TEXT NOT NULL,
                    org_name TEXT NOT NULL,
                    academic_year INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS course_instructors (
                    course_id INTEGER NOT NULL REFERENCES courses(id),
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    PRIMARY KEY (course_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS students (
                    id INTEGER PRIMARY KEY,
                    username TEXT NOT NULL,
                    full_name TEXT NOT NULL DEFAULT ''
                );

                CREATE TABLE IF NOT EXISTS assignments (
                    id INTEGER PRIMARY KEY,
                    course_id INTEGER NOT NULL REFERENCES courses(id)
                );

                CREATE TABLE IF NOT EXISTS submissions (
                    id INTEGER PRIMARY KEY,
                    assignment_id INTEGER NOT NULL REFERENCES assignments(id),
                    student_id INTEGER NOT NULL REFERENCES students(id),
                    repo_url TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_submissions_repo_url
                    ON submissions(repo_url);

                CREATE TABLE IF NOT EXISTS review_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id INTEGER NOT NULL REFERENCES submissions(id),
                    status TEXT NOT NULL,
                    requested_at TEXT NOT NULL,
                    submitted_at TEXT,
                    reviewed_at TEXT,
                    ledger_row_id INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_review_requests_submission
                    ON review_requests(submission_id, requested_at DESC);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: storage-level backstop for one active request per submission.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_review_requests_one_active
                    ON review_requests(submission_id)
                    WHERE status IN ('pending', 'submitted');
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

fn id_to_i64(id: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(id).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("id {} exceeds maximum storable value ({})", id, i64::MAX),
        )
    })
}

fn i64_to_id(value: i64, what: &'static str) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::corruption(what))
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| RepositoryError::corruption("review timestamp"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

/// Raw `review_requests` row, converted outside the rusqlite row callback.
struct ReviewRow {
    id: i64,
    submission_id: i64,
    status: String,
    requested_at: String,
    submitted_at: Option<String>,
    reviewed_at: Option<String>,
    ledger_row_id: Option<i64>,
}

impl ReviewRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            submission_id: row.get(1)?,
            status: row.get(2)?,
            requested_at: row.get(3)?,
            submitted_at: row.get(4)?,
            reviewed_at: row.get(5)?,
            ledger_row_id: row.get(6)?,
        })
    }

    fn into_review(self) -> Result<ReviewRequest, RepositoryError> {
        let ledger_row_id = self
            .ledger_row_id
            .map(|row| u32::try_from(row).map(LedgerRowId))
            .transpose()
            .map_err(|_| RepositoryError::corruption("ledger row id"))?;

        Ok(ReviewRequest {
            id: ReviewRequestId(i64_to_id(self.id, "review id")?),
            submission_id: SubmissionId(i64_to_id(self.submission_id, "submission id")?),
            status: self
                .status
                .parse()
                .map_err(|_| RepositoryError::corruption("review status"))?,
            requested_at: parse_timestamp(&self.requested_at)?,
            submitted_at: self.submitted_at.as_deref().map(parse_timestamp).transpose()?,
            reviewed_at: self.reviewed_at.as_deref().map(parse_timestamp).transpose()?,
            ledger_row_id,
        })
    }
}

/// id, course id, slug, org, year, repo url, student username, student full name.
type SubmissionRow = (i64, i64, String, String, i32, String, String, String);

fn read_submission(row: &Row<'_>) -> rusqlite::Result<SubmissionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_submission(
    (id, course_id, slug, org_name, academic_year, repo_url, username, full_name): SubmissionRow,
) -> Result<Submission, RepositoryError> {
    Ok(Submission {
        id: SubmissionId(i64_to_id(id, "submission id")?),
        course_id: CourseId(i64_to_id(course_id, "course id")?),
        course_slug: slug,
        org_name,
        academic_year,
        repo_url,
        student: Student {
            username,
            full_name,
        },
    })
}

fn read_user(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_user(
    (id, username, full_name, access_token): (i64, String, String, Option<String>),
) -> Result<User, RepositoryError> {
    Ok(User {
        id: UserId(i64_to_id(id, "user id")?),
        username,
        full_name,
        access_token: access_token.filter(|token| !token.trim().is_empty()),
    })
}

fn query_reviews(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ReviewRequest>, RepositoryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    let rows = stmt
        .query_map(params, ReviewRow::read)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;

    let mut reviews = Vec::new();
    for row in rows {
        let row = row.map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
        reviews.push(row.into_review()?);
    }
    Ok(reviews)
}

// =============================================================================
// ReviewRepository trait implementation
// =============================================================================

#[async_trait]
impl ReviewRepository for SqliteRepository {
    async fn get_review(
        &self,
        id: ReviewRequestId,
    ) -> Result<Option<ReviewRequest>, RepositoryError> {
        let id = id_to_i64(id.0, "get_review")?;
        self.run("get_review", move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM review_requests WHERE id = ?1", REVIEW_COLUMNS),
                params![id],
                ReviewRow::read,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get_review", e.to_string()))?
            .map(ReviewRow::into_review)
            .transpose()
        })
        .await
    }

    async fn find_reviews(
        &self,
        submission_id: SubmissionId,
        statuses: &[ReviewStatus],
    ) -> Result<Vec<ReviewRequest>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let submission_id = id_to_i64(submission_id.0, "find_reviews")?;
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();

        self.run("find_reviews", move |conn| {
            let placeholders: Vec<String> =
                (0..statuses.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = format!(
                "SELECT {} FROM review_requests
                 WHERE submission_id = ?1 AND status IN ({})
                 ORDER BY requested_at DESC, id DESC",
                REVIEW_COLUMNS,
                placeholders.join(", ")
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&submission_id];
            values.extend(statuses.iter().map(|s| s as &dyn rusqlite::ToSql));
            query_reviews(conn, "find_reviews", &sql, values.as_slice())
        })
        .await
    }

    async fn list_reviews_with_status(
        &self,
        status: ReviewStatus,
    ) -> Result<Vec<ReviewRequest>, RepositoryError> {
        self.run("list_reviews_with_status", move |conn| {
            query_reviews(
                conn,
                "list_reviews_with_status",
                &format!(
                    "SELECT {} FROM review_requests WHERE status = ?1
                     ORDER BY requested_at ASC, id ASC",
                    REVIEW_COLUMNS
                ),
                params![status.as_str()],
            )
        })
        .await
    }

    async fn create_review(
        &self,
        new: NewReviewRequest,
    ) -> Result<ReviewRequest, RepositoryError> {
        let owner = new.submission_id;
        let submission_id = id_to_i64(owner.0, "create_review")?;
        let requested_at = format_timestamp(&new.requested_at);

        let id = self
            .run("create_review", move |conn| {
                conn.execute(
                    "INSERT INTO review_requests (submission_id, status, requested_at)
                     VALUES (?1, ?2, ?3)",
                    params![submission_id, ReviewStatus::Pending.as_str(), requested_at],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        RepositoryError::ActiveReviewExists(owner)
                    } else {
                        RepositoryError::storage("create_review", e.to_string())
                    }
                })?;
                i64_to_id(conn.last_insert_rowid(), "review id")
            })
            .await?;

        Ok(new.into_request(ReviewRequestId(id)))
    }

    async fn save_review(&self, review: &ReviewRequest) -> Result<(), RepositoryError> {
        let id = id_to_i64(review.id.0, "save_review")?;
        let review_id = review.id;
        let submission_id = review.submission_id;
        let status = review.status.as_str();
        let submitted_at = review.submitted_at.as_ref().map(format_timestamp);
        let reviewed_at = review.reviewed_at.as_ref().map(format_timestamp);
        let ledger_row_id = review.ledger_row_id.map(|row| i64::from(row.0));

        self.run("save_review", move |conn| {
            let updated = conn
                .execute(
                    "UPDATE review_requests
                     SET status = ?2, submitted_at = ?3, reviewed_at = ?4, ledger_row_id = ?5
                     WHERE id = ?1",
                    params![id, status, submitted_at, reviewed_at, ledger_row_id],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        RepositoryError::ActiveReviewExists(submission_id)
                    } else {
                        RepositoryError::storage("save_review", e.to_string())
                    }
                })?;
            if updated == 0 {
                return Err(RepositoryError::ReviewNotFound(review_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_submission(
        &self,
        id: SubmissionId,
    ) -> Result<Option<Submission>, RepositoryError> {
        let id = id_to_i64(id.0, "get_submission")?;
        self.run("get_submission", move |conn| {
            conn.query_row(
                &format!("{} WHERE s.id = ?1", SUBMISSION_SELECT),
                params![id],
                read_submission,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get_submission", e.to_string()))?
            .map(into_submission)
            .transpose()
        })
        .await
    }

    async fn find_submission_by_repo_url(
        &self,
        repo_url: &str,
    ) -> Result<Option<Submission>, RepositoryError> {
        let repo_url = repo_url.to_string();
        self.run("find_submission_by_repo_url", move |conn| {
            conn.query_row(
                &format!(
                    "{} WHERE s.repo_url = ?1 ORDER BY s.id DESC LIMIT 1",
                    SUBMISSION_SELECT
                ),
                params![repo_url],
                read_submission,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_submission_by_repo_url", e.to_string()))?
            .map(into_submission)
            .transpose()
        })
        .await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let id = id_to_i64(id.0, "get_user")?;
        self.run("get_user", move |conn| {
            conn.query_row(
                "SELECT id, username, full_name, access_token FROM users WHERE id = ?1",
                params![id],
                read_user,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get_user", e.to_string()))?
            .map(into_user)
            .transpose()
        })
        .await
    }

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, RepositoryError> {
        let username = username.to_string();
        self.run("find_user_by_username", move |conn| {
            conn.query_row(
                "SELECT id, username, full_name, access_token FROM users WHERE username = ?1",
                params![username],
                read_user,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_user_by_username", e.to_string()))?
            .map(into_user)
            .transpose()
        })
        .await
    }

    async fn is_course_instructor(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<bool, RepositoryError> {
        let user_id = id_to_i64(user_id.0, "is_course_instructor")?;
        let course_id = id_to_i64(course_id.0, "is_course_instructor")?;
        self.run("is_course_instructor", move |conn| {
            conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM course_instructors WHERE course_id = ?1 AND user_id = ?2
                 )",
                params![course_id, user_id],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| RepositoryError::storage("is_course_instructor", e.to_string()))
        })
        .await
    }

    async fn find_course_instructor(
        &self,
        course_id: CourseId,
    ) -> Result<Option<User>, RepositoryError> {
        let course_id = id_to_i64(course_id.0, "find_course_instructor")?;
        self.run("find_course_instructor", move |conn| {
            conn.query_row(
                "SELECT u.id, u.username, u.full_name, u.access_token
                 FROM course_instructors ci
                 JOIN users u ON u.id = ci.user_id
                 WHERE ci.course_id = ?1
                 ORDER BY (u.access_token IS NULL OR u.access_token = '') ASC, u.id ASC
                 LIMIT 1",
                params![course_id],
                read_user,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("find_course_instructor", e.to_string()))?
            .map(into_user)
            .transpose()
        })
        .await
    }
}
