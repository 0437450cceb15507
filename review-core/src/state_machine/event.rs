//! Events that drive review request transitions.
//!
//! Events come from two places: user or worker actions (cancel, window closed,
//! review submitted, force cancel) and the results of executed effects
//! (a ledger row was appended).

use chrono::{DateTime, Utc};

use crate::model::LedgerRowId;

/// All events that can trigger a review request transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The owning student withdrew the request inside its cancellation window.
    CancelRequested,

    /// The cancellation window closed, either by expiry or by an immediate-submit command.
    WindowClosed { at: DateTime<Utc> },

    /// The ledger accepted the row for this request.
    LedgerRowAppended { row: LedgerRowId },

    /// An instructor closed the loop.
    ReviewSubmitted {
        at: DateTime<Utc>,
        /// Instructor override: accept a request that is still `Pending`.
        allow_pending: bool,
    },

    /// Instructor escape hatch, valid from any non-cancelled status.
    ForceCancelRequested,
}

impl Event {
    /// Short name for logs.
    pub fn log_summary(&self) -> &'static str {
        match self {
            Event::CancelRequested => "CancelRequested",
            Event::WindowClosed { .. } => "WindowClosed",
            Event::LedgerRowAppended { .. } => "LedgerRowAppended",
            Event::ReviewSubmitted { .. } => "ReviewSubmitted",
            Event::ForceCancelRequested => "ForceCancelRequested",
        }
    }
}
