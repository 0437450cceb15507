use axum::http::{Request, StatusCode};
use review_core::{AccessLevel, LedgerRowId, LedgerStatus, ReviewStatus, SubmissionId};
use serde_json::{json, Value};

use super::signature::sign;
use super::*;
use crate::test_support::{AccessCall, LedgerCall, TestApp};

const SECRET: &str = "webhook-secret";
const REPO_URL: &str = "https://git.example.com/algo-2025/hw1-alice";

fn delivery(event: &str, payload: &Value, signature: Option<String>) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/gitea")
        .header("content-type", "application/json")
        .header(EVENT_HEADER, event);
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

fn signed(event: &str, payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    delivery(event, payload, Some(sign(SECRET, &body)))
}

fn comment(author: &str, body: &str) -> Value {
    json!({
        "action": "created",
        "is_pull": true,
        "issue": { "number": 1, "title": "Feedback" },
        "comment": { "id": 9, "body": body, "user": { "login": author, "username": author } },
        "repository": { "full_name": "algo-2025/hw1-alice", "html_url": REPO_URL }
    })
}

fn review_requested(sender: &str, title: &str) -> Value {
    json!({
        "action": "review_requested",
        "number": 1,
        "pull_request": { "id": 3, "title": title },
        "repository": { "full_name": "algo-2025/hw1-alice", "html_url": REPO_URL },
        "sender": { "login": sender }
    })
}

fn review_submitted(reviewer: &str) -> Value {
    json!({
        "action": "submitted",
        "pull_request": { "id": 3, "title": "Feedback" },
        "repository": { "html_url": REPO_URL },
        "sender": { "login": reviewer },
        "review": { "type": "approved" }
    })
}

async fn app() -> TestApp {
    TestApp::new(Some(SECRET)).await
}

async fn latest_status(app: &TestApp) -> Option<ReviewStatus> {
    app.state
        .engine
        .latest_review(
            SubmissionId(42),
            &[
                ReviewStatus::Pending,
                ReviewStatus::Submitted,
                ReviewStatus::Reviewed,
                ReviewStatus::Cancelled,
            ],
        )
        .await
        .unwrap()
        .map(|review| review.status)
}

// =========================================================================
// Authentication and parsing
// =========================================================================

#[tokio::test]
async fn test_missing_signature_is_unauthorized() {
    let app = app().await;
    let (status, body) = app
        .send(delivery("issue_comment", &comment("alice", "/review"), None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "invalid signature" }));
    assert_eq!(latest_status(&app).await, None);
}

#[tokio::test]
async fn test_signature_over_other_body_is_unauthorized() {
    let app = app().await;
    let signature = sign(SECRET, b"{}");
    let (status, _) = app
        .send(delivery(
            "issue_comment",
            &comment("alice", "/review"),
            Some(signature),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_prefixed_signature_is_accepted() {
    let app = app().await;
    let payload = comment("alice", "/review");
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = format!("sha256={}", sign(SECRET, &body));
    let (status, body) = app
        .send(delivery("issue_comment", &payload, Some(signature)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "review_requested");
}

#[tokio::test]
async fn test_unsigned_delivery_accepted_without_secret() {
    let app = TestApp::new(None).await;
    let (status, body) = app
        .send(delivery("issue_comment", &comment("alice", "/review"), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "review_requested");
}

#[tokio::test]
async fn test_unparseable_body_is_bad_request() {
    let app = app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/gitea")
        .header(EVENT_HEADER, "issue_comment")
        .header(SIGNATURE_HEADER, sign(SECRET, b"{not json"))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("invalid issue_comment payload"));
}

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let app = app().await;
    let (status, body) = app.send(signed("push", &json!({ "ref": "main" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ignored" }));
}

// =========================================================================
// Pull request events
// =========================================================================

#[tokio::test]
async fn test_review_requested_locks_repository() {
    let app = app().await;
    let (status, body) = app
        .send(signed("pull_request", &review_requested("alice", "Feedback")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "review_requested");
    assert!(body["review_request_id"].is_u64());
    assert!(body["cancel_deadline"].is_string());

    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Pending));
    let calls = app.access.calls();
    assert!(calls.contains(&AccessCall::SetAccess(
        "alice".to_string(),
        AccessLevel::Read
    )));
    assert!(calls.contains(&AccessCall::Protect(
        "main".to_string(),
        "instructor-token".to_string()
    )));
}

#[tokio::test]
async fn test_review_requested_outcomes() {
    let app = app().await;

    let (_, body) = app
        .send(signed("pull_request", &review_requested("alice", "Fix typo")))
        .await;
    assert_eq!(body["status"], "ignored");

    let (_, body) = app
        .send(signed("pull_request", &review_requested("mallory", "Feedback")))
        .await;
    assert_eq!(body["status"], "not_submission_owner");

    let (_, body) = app
        .send(signed("pull_request", &review_requested("alice", "Feedback")))
        .await;
    assert_eq!(body["status"], "review_requested");

    let (status, body) = app
        .send(signed("pull_request", &review_requested("alice", "Feedback")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "review_already_active");

    let mut elsewhere = review_requested("alice", "Feedback");
    elsewhere["repository"]["html_url"] = json!("https://git.example.com/algo-2025/hw9-zed");
    let (_, body) = app.send(signed("pull_request", &elsewhere)).await;
    assert_eq!(body["status"], "submission_not_found");
}

// =========================================================================
// Comment commands
// =========================================================================

#[tokio::test]
async fn test_comment_filters() {
    let app = app().await;

    let mut edited = comment("alice", "/review");
    edited["action"] = json!("edited");
    let (_, body) = app.send(signed("issue_comment", &edited)).await;
    assert_eq!(body["status"], "ignored");

    let mut on_issue = comment("alice", "/review");
    on_issue["is_pull"] = json!(false);
    let (_, body) = app.send(signed("issue_comment", &on_issue)).await;
    assert_eq!(body["status"], "not_pull_request");

    let mut other_pr = comment("alice", "/review");
    other_pr["issue"]["title"] = json!("Setup");
    let (_, body) = app.send(signed("issue_comment", &other_pr)).await;
    assert_eq!(body["status"], "not_feedback_pr");

    let (_, body) = app
        .send(signed("issue_comment", &comment("alice", "please /review")))
        .await;
    assert_eq!(body["status"], "not_review_command");

    let (_, body) = app
        .send(signed("issue_comment", &comment("mallory", "/review")))
        .await;
    assert_eq!(body["status"], "not_submission_owner");

    assert_eq!(latest_status(&app).await, None);
}

#[tokio::test]
async fn test_unreview_inside_window_cancels() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review")))
        .await;

    let (status, body) = app
        .send(signed("issue_comment", &comment("alice", "/unreview")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "review_cancelled");
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Cancelled));
    assert!(app.access.calls().contains(&AccessCall::SetAccess(
        "alice".to_string(),
        AccessLevel::Write
    )));

    let (_, body) = app
        .send(signed("issue_comment", &comment("alice", "/unreview")))
        .await;
    assert_eq!(body["status"], "no_pending_review");
}

#[tokio::test]
async fn test_review_now_then_unreview_is_too_late() {
    let app = app().await;
    let (_, body) = app
        .send(signed("issue_comment", &comment("alice", "/review_now")))
        .await;
    assert_eq!(body["status"], "review_submitted_immediately");
    assert_eq!(body["ledger_row_id"], 2);
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Submitted));

    let (_, body) = app
        .send(signed("issue_comment", &comment("alice", "/unreview")))
        .await;
    assert_eq!(body["status"], "no_pending_review");

    let (_, body) = app
        .send(signed("issue_comment", &comment("alice", "/review")))
        .await;
    assert_eq!(body["status"], "review_already_active");
}

#[tokio::test]
async fn test_force_unreview_requires_instructor() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review")))
        .await;

    let (status, body) = app
        .send(signed("issue_comment", &comment("alice", "/force_unreview")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "forbidden");

    let (_, body) = app
        .send(signed("issue_comment", &comment("stranger", "/force_unreview")))
        .await;
    assert_eq!(body["status"], "commenter_not_found");

    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Pending));
}

#[tokio::test]
async fn test_force_unreview_after_submission_deletes_ledger_row() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review_now")))
        .await;

    let (_, body) = app
        .send(signed("issue_comment", &comment("prof", "/force_unreview")))
        .await;
    assert_eq!(body["status"], "force_cancelled");
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Cancelled));
    assert!(app
        .ledger
        .calls()
        .contains(&LedgerCall::Delete(LedgerRowId(2))));

    let (_, body) = app
        .send(signed("issue_comment", &comment("prof", "/force_unreview")))
        .await;
    assert_eq!(body["status"], "no_review_request");
}

// =========================================================================
// Review submissions
// =========================================================================

#[tokio::test]
async fn test_review_submitted_by_instructor_closes_request() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review_now")))
        .await;

    let (_, body) = app
        .send(signed("pull_request_review", &review_submitted("alice")))
        .await;
    assert_eq!(body["status"], "reviewer_not_instructor");

    let (_, body) = app
        .send(signed("pull_request_review", &review_submitted("prof")))
        .await;
    assert_eq!(body["status"], "processed");
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Reviewed));
    assert!(app.ledger.calls().contains(&LedgerCall::Update(
        LedgerRowId(2),
        LedgerStatus::Reviewed
    )));

    let (_, body) = app
        .send(signed("pull_request_review", &review_submitted("prof")))
        .await;
    assert_eq!(body["status"], "no_active_review");
}

#[tokio::test]
async fn test_review_submitted_ignores_pending_request() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review")))
        .await;

    let (_, body) = app
        .send(signed("pull_request_review", &review_submitted("prof")))
        .await;
    assert_eq!(body["status"], "no_active_review");
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Pending));
}

#[tokio::test]
async fn test_legacy_approval_overrides_pending_window() {
    let app = app().await;
    app.send(signed("issue_comment", &comment("alice", "/review")))
        .await;

    let payload = json!({
        "repository": { "html_url": REPO_URL },
        "sender": { "username": "prof" }
    });
    let (_, body) = app.send(signed("pull_request_approved", &payload)).await;
    assert_eq!(body["status"], "processed");
    assert_eq!(latest_status(&app).await, Some(ReviewStatus::Reviewed));
    assert_eq!(app.state.engine.pending_cache().len().await, 0);
}

#[tokio::test]
async fn test_legacy_approval_without_repository() {
    let app = app().await;
    let payload = json!({ "sender": { "login": "prof" } });
    let (status, body) = app.send(signed("pull_request_rejected", &payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "invalid_repository");
}
