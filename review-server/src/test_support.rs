//! Fixtures and fakes shared by the crate's unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;
use review_core::{
    AccessLevel, CourseId, LedgerRowId, LedgerStatus, RepoRef, Student, Submission, SubmissionId,
    User, UserId,
};

use crate::engine::{EngineSettings, ReviewEngine};
use crate::gitea::{AccessController, WebhookRegistration};
use crate::ledger::{Ledger, LedgerRow};
use crate::persistence::InMemoryRepository;
use crate::{app_router, AppState};

pub const JWT_SECRET: &str = "jwt-secret";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
}

pub fn submission() -> Submission {
    Submission {
        id: SubmissionId(42),
        course_id: CourseId(7),
        course_slug: "algo".to_string(),
        org_name: "algo-2025".to_string(),
        academic_year: 2025,
        repo_url: "https://git.example.com/algo-2025/hw1-alice".to_string(),
        student: Student {
            username: "alice".to_string(),
            full_name: "Alice Liddell".to_string(),
        },
    }
}

pub fn student_user() -> User {
    User {
        id: UserId(2),
        username: "alice".to_string(),
        full_name: "Alice Liddell".to_string(),
        access_token: None,
    }
}

pub fn instructor() -> User {
    User {
        id: UserId(1),
        username: "prof".to_string(),
        full_name: "Professor Plum".to_string(),
        access_token: Some("instructor-token".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCall {
    SetAccess(String, AccessLevel),
    /// Branch, token.
    Protect(String, String),
    Unprotect(String, String),
    /// Team, username.
    TeamCheck(String, String),
    RegisterWebhook(String),
}

/// Records every call; optionally fails all of them.
#[derive(Default)]
pub struct FakeAccessController {
    calls: Mutex<Vec<AccessCall>>,
    team_members: Mutex<HashSet<String>>,
    fail: bool,
}

impl FakeAccessController {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn add_team_member(&self, username: &str) {
        self.team_members
            .lock()
            .unwrap()
            .insert(username.to_string());
    }

    pub fn calls(&self) -> Vec<AccessCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AccessCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(anyhow!("gitea unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl AccessController for FakeAccessController {
    async fn set_collaborator_access(
        &self,
        _repo: &RepoRef,
        username: &str,
        level: AccessLevel,
    ) -> Result<()> {
        self.record(AccessCall::SetAccess(username.to_string(), level))
    }

    async fn enable_branch_protection(
        &self,
        _repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        self.record(AccessCall::Protect(branch.to_string(), token.to_string()))
    }

    async fn disable_branch_protection(
        &self,
        _repo: &RepoRef,
        branch: &str,
        token: &str,
    ) -> Result<()> {
        self.record(AccessCall::Unprotect(branch.to_string(), token.to_string()))
    }

    async fn is_team_member(
        &self,
        _org: &str,
        team_name: &str,
        username: &str,
        _token: &str,
    ) -> Result<bool> {
        self.record(AccessCall::TeamCheck(
            team_name.to_string(),
            username.to_string(),
        ))?;
        Ok(self.team_members.lock().unwrap().contains(username))
    }

    async fn register_webhook(
        &self,
        _repo: &RepoRef,
        registration: &WebhookRegistration,
    ) -> Result<bool> {
        self.record(AccessCall::RegisterWebhook(registration.url.clone()))?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    Append(LedgerRow),
    Update(LedgerRowId, LedgerStatus),
    Delete(LedgerRowId),
}

/// In-memory ledger. Row 1 is the header, so the first append lands on row 2.
pub struct FakeLedger {
    calls: Mutex<Vec<LedgerCall>>,
    next_row: Mutex<u32>,
    fail: bool,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_row: Mutex::new(2),
            fail: false,
        }
    }
}

impl FakeLedger {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: LedgerCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(anyhow!("sheets unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn append_review_request(&self, row: &LedgerRow) -> Result<LedgerRowId> {
        self.record(LedgerCall::Append(row.clone()))?;
        let mut next = self.next_row.lock().unwrap();
        let row = LedgerRowId(*next);
        *next += 1;
        Ok(row)
    }

    async fn update_row_status(&self, row: LedgerRowId, status: LedgerStatus) -> Result<()> {
        self.record(LedgerCall::Update(row, status))
    }

    async fn delete_row(&self, row: LedgerRowId) -> Result<()> {
        self.record(LedgerCall::Delete(row))
    }
}

/// The full router over in-memory storage seeded with one course, its
/// instructor (also on the Gitea team) and alice's submission.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub access: Arc<FakeAccessController>,
    pub ledger: Arc<FakeLedger>,
}

impl TestApp {
    pub async fn new(webhook_secret: Option<&str>) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_submission(submission()).await;
        repo.insert_user(student_user()).await;
        repo.insert_user(instructor()).await;
        repo.add_course_instructor(CourseId(7), instructor().id)
            .await;

        let access = Arc::new(FakeAccessController::default());
        access.add_team_member("prof");
        let ledger = Arc::new(FakeLedger::default());
        let engine = ReviewEngine::new(
            repo,
            access.clone(),
            Some(ledger.clone()),
            EngineSettings {
                pending_window: Duration::from_secs(15 * 60),
                protected_branch: "main".to_string(),
                webhook: None,
            },
        );
        let state = Arc::new(AppState {
            engine: Arc::new(engine),
            webhook_secret: webhook_secret.map(str::to_string),
            jwt_secret: JWT_SECRET.to_string(),
        });
        Self {
            router: app_router(state.clone()),
            state,
            access,
            ledger,
        }
    }

    /// Send one request; the body is decoded as JSON, or `Null` when empty.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}
