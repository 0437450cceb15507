//! Gitea webhook payloads, keyed by the `X-Gitea-Event` header.
//!
//! Each shape carries only the fields the review flow reads. Missing fields
//! default to empty so that a sparse delivery is classified, not rejected.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Account {
    pub login: String,
    pub username: String,
}

impl Account {
    /// Gitea fills `username` on newer versions and `login` on all of them.
    pub fn name(&self) -> &str {
        if self.username.is_empty() {
            &self.login
        } else {
            &self.username
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub full_name: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PullRequestSummary {
    pub title: String,
}

/// `pull_request` and `pull_request_review` deliveries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequestSummary,
    pub repository: Repository,
    pub sender: Account,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IssueSummary {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub body: String,
    pub user: Account,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IssueCommentEvent {
    pub action: String,
    pub is_pull: bool,
    pub issue: IssueSummary,
    pub comment: Comment,
    pub repository: Repository,
}

/// What a legacy "reviewed" delivery tells us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyReviewed {
    pub repo_url: Option<String>,
    pub reviewer: Option<String>,
}

impl LegacyReviewed {
    /// These deliveries vary by Gitea version, so read them loosely.
    fn extract(payload: &Value) -> Self {
        let repo_url = payload
            .get("repository")
            .and_then(|repo| repo.get("html_url"))
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        let reviewer = payload.get("sender").and_then(|sender| {
            ["username", "login"]
                .iter()
                .filter_map(|key| sender.get(*key).and_then(Value::as_str))
                .find(|name| !name.is_empty())
                .map(str::to_string)
        });
        Self { repo_url, reviewer }
    }
}

#[derive(Debug, Clone)]
pub enum GiteaEvent {
    PullRequest(PullRequestEvent),
    PullRequestReview(PullRequestEvent),
    IssueComment(IssueCommentEvent),
    /// `pull_request_approved`, `pull_request_rejected`, or a `pull_request`
    /// with action `reviewed`.
    LegacyReviewed(LegacyReviewed),
    Unsupported(String),
}

impl GiteaEvent {
    /// Parse a delivery body. Only a body that is not valid JSON for its event
    /// type is an error; unknown event types are `Unsupported`.
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            "pull_request" => {
                let payload: Value = serde_json::from_slice(body)?;
                if payload.get("action").and_then(Value::as_str) == Some("reviewed") {
                    GiteaEvent::LegacyReviewed(LegacyReviewed::extract(&payload))
                } else {
                    GiteaEvent::PullRequest(serde_json::from_value(payload)?)
                }
            }
            "pull_request_review" => GiteaEvent::PullRequestReview(serde_json::from_slice(body)?),
            "pull_request_approved" | "pull_request_rejected" => {
                let payload: Value = serde_json::from_slice(body)?;
                GiteaEvent::LegacyReviewed(LegacyReviewed::extract(&payload))
            }
            "issue_comment" => GiteaEvent::IssueComment(serde_json::from_slice(body)?),
            other => GiteaEvent::Unsupported(other.to_string()),
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            GiteaEvent::PullRequest(_) => "pull_request",
            GiteaEvent::PullRequestReview(_) => "pull_request_review",
            GiteaEvent::IssueComment(_) => "issue_comment",
            GiteaEvent::LegacyReviewed(_) => "legacy_reviewed",
            GiteaEvent::Unsupported(kind) => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_pull_request_review_requested() {
        let body = bytes(json!({
            "action": "review_requested",
            "number": 1,
            "pull_request": { "id": 10, "title": "Feedback" },
            "repository": {
                "full_name": "algo-2025/hw1-alice",
                "html_url": "https://git.example.com/algo-2025/hw1-alice"
            },
            "sender": { "id": 2, "login": "alice", "username": "alice" }
        }));
        let GiteaEvent::PullRequest(event) = GiteaEvent::parse("pull_request", &body).unwrap()
        else {
            panic!("expected a pull request event");
        };
        assert_eq!(event.action, "review_requested");
        assert_eq!(event.pull_request.title, "Feedback");
        assert_eq!(event.sender.name(), "alice");
        assert_eq!(
            event.repository.html_url,
            "https://git.example.com/algo-2025/hw1-alice"
        );
    }

    #[test]
    fn test_sender_name_falls_back_to_login() {
        let account: Account = serde_json::from_value(json!({ "login": "prof" })).unwrap();
        assert_eq!(account.name(), "prof");
    }

    #[test]
    fn test_issue_comment() {
        let body = bytes(json!({
            "action": "created",
            "is_pull": true,
            "issue": { "number": 1, "title": "Feedback" },
            "comment": { "id": 5, "body": " /review \n", "user": { "login": "alice" } },
            "repository": { "html_url": "https://git.example.com/algo-2025/hw1-alice" }
        }));
        let GiteaEvent::IssueComment(event) = GiteaEvent::parse("issue_comment", &body).unwrap()
        else {
            panic!("expected an issue comment event");
        };
        assert!(event.is_pull);
        assert_eq!(event.comment.body, " /review \n");
        assert_eq!(event.comment.user.name(), "alice");
    }

    #[test]
    fn test_reviewed_action_uses_loose_extractor() {
        let body = bytes(json!({
            "action": "reviewed",
            "repository": { "html_url": "https://git.example.com/algo-2025/hw1-alice" },
            "sender": { "login": "prof" },
            "review": { "type": "pull_request_review_approved" }
        }));
        let event = GiteaEvent::parse("pull_request", &body).unwrap();
        let GiteaEvent::LegacyReviewed(reviewed) = event else {
            panic!("expected a legacy reviewed event");
        };
        assert_eq!(
            reviewed,
            LegacyReviewed {
                repo_url: Some("https://git.example.com/algo-2025/hw1-alice".to_string()),
                reviewer: Some("prof".to_string()),
            }
        );
    }

    #[test]
    fn test_approved_without_repository() {
        let body = bytes(json!({ "sender": { "login": "prof" } }));
        let GiteaEvent::LegacyReviewed(reviewed) =
            GiteaEvent::parse("pull_request_approved", &body).unwrap()
        else {
            panic!("expected a legacy reviewed event");
        };
        assert_eq!(reviewed.repo_url, None);
    }

    #[test]
    fn test_unknown_event_is_not_parsed() {
        let event = GiteaEvent::parse("push", b"not json").unwrap();
        assert!(matches!(event, GiteaEvent::Unsupported(kind) if kind == "push"));
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(GiteaEvent::parse("issue_comment", b"{").is_err());
        assert!(GiteaEvent::parse("pull_request", b"[1, 2").is_err());
        assert!(GiteaEvent::parse("issue_comment", br#"{"is_pull": "yes"}"#).is_err());
    }
}
