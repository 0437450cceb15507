//! Core of the classroom review gate.
//!
//! Everything here is pure or in-memory: the review request records, the
//! pending-window cache, the lifecycle state machine and the magic-command parser.
//! The server crate supplies storage, Gitea and the ledger.

pub mod cache;
pub mod command;
pub mod model;
pub mod state_machine;

pub use cache::{PendingCacheEntry, PendingReviewCache};
pub use command::{is_feedback_thread, parse_comment, MagicCommand, FEEDBACK_PR_TITLE};
pub use model::*;
pub use state_machine::{
    lock_effects, transition, unlock_effects, Effect, Event, TransitionError, TransitionResult,
};
