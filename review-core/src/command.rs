//! Magic commands recognised in comments on the feedback pull request.
use std::fmt;

/// Title of the pull request that carries review commands and feedback.
pub const FEEDBACK_PR_TITLE: &str = "Feedback";

/// Whether a pull request title marks the feedback thread.
pub fn is_feedback_thread(title: &str) -> bool {
    title == FEEDBACK_PR_TITLE
}

/// A command a student or instructor can post as a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicCommand {
    /// `/review` or `@review`: open a review request.
    RequestReview,
    /// `/unreview`: withdraw a request inside its cancellation window.
    CancelReview,
    /// `/review_now`: open a request and skip the cancellation window.
    SubmitNow,
    /// `/force_unreview`: instructor-only cancel of the latest live request.
    ForceCancel,
}

impl fmt::Display for MagicCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagicCommand::RequestReview => write!(f, "/review"),
            MagicCommand::CancelReview => write!(f, "/unreview"),
            MagicCommand::SubmitNow => write!(f, "/review_now"),
            MagicCommand::ForceCancel => write!(f, "/force_unreview"),
        }
    }
}

/// Parse a comment body.
///
/// The whole comment, after trimming surrounding whitespace, must be exactly one
/// command. Commands are case-sensitive; anything else is `None`.
pub fn parse_comment(body: &str) -> Option<MagicCommand> {
    match body.trim() {
        "/review" | "@review" => Some(MagicCommand::RequestReview),
        "/unreview" => Some(MagicCommand::CancelReview),
        "/review_now" => Some(MagicCommand::SubmitNow),
        "/force_unreview" => Some(MagicCommand::ForceCancel),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_command() {
        assert_eq!(parse_comment("/review"), Some(MagicCommand::RequestReview));
        assert_eq!(parse_comment("@review"), Some(MagicCommand::RequestReview));
        assert_eq!(parse_comment("/unreview"), Some(MagicCommand::CancelReview));
        assert_eq!(parse_comment("/review_now"), Some(MagicCommand::SubmitNow));
        assert_eq!(
            parse_comment("/force_unreview"),
            Some(MagicCommand::ForceCancel)
        );
    }

    #[test]
    fn test_parse_trims_surrounding_whitespace() {
        assert_eq!(
            parse_comment("  \n/review_now\r\n "),
            Some(MagicCommand::SubmitNow)
        );
    }

    #[test]
    fn test_parse_rejects_commands_inside_prose() {
        assert_eq!(parse_comment("please /review this"), None);
        assert_eq!(parse_comment("/review\nthanks!"), None);
        assert_eq!(parse_comment("/REVIEW"), None);
        assert_eq!(parse_comment("/reviews"), None);
        assert_eq!(parse_comment(""), None);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for command in [
            MagicCommand::RequestReview,
            MagicCommand::CancelReview,
            MagicCommand::SubmitNow,
            MagicCommand::ForceCancel,
        ] {
            assert_eq!(parse_comment(&command.to_string()), Some(command));
        }
    }

    #[test]
    fn test_feedback_thread_title_is_exact() {
        assert!(is_feedback_thread("Feedback"));
        assert!(!is_feedback_thread("feedback"));
        assert!(!is_feedback_thread("Feedback #2"));
    }
}
