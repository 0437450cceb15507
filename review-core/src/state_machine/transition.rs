//! Pure transition function for review requests.
//!
//! `Pending -> {Submitted, Cancelled}`, `Submitted -> Reviewed`, and
//! `Pending -> Reviewed` only through the instructor override. Force cancel
//! acts on any status except `Cancelled`.

use super::effect::{unlock_effects, Effect};
use super::event::Event;
use crate::model::{LedgerStatus, ReviewRequest, ReviewStatus};

/// Result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The record after the transition.
    pub request: ReviewRequest,
    /// Effects to execute once the record is persisted.
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(request: ReviewRequest, effects: Vec<Effect>) -> Self {
        Self { request, effects }
    }

    pub fn no_change(request: ReviewRequest) -> Self {
        Self {
            request,
            effects: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot apply {event} to a {from} review request")]
    InvalidTransition {
        from: ReviewStatus,
        event: &'static str,
    },
}

/// Pure transition function.
///
/// Returns the updated record and the effects to run, or an error when the event
/// is not valid for the record's current status. Never performs I/O.
pub fn transition(
    request: &ReviewRequest,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let invalid = |event: &Event| TransitionError::InvalidTransition {
        from: request.status,
        event: event.log_summary(),
    };

    match (request.status, event) {
        (ReviewStatus::Pending, Event::CancelRequested) => {
            let mut next = request.clone();
            next.status = ReviewStatus::Cancelled;
            Ok(TransitionResult::new(next, unlock_effects()))
        }

        (ReviewStatus::Pending, Event::WindowClosed { at }) => {
            let mut next = request.clone();
            next.status = ReviewStatus::Submitted;
            next.submitted_at = Some(at);
            Ok(TransitionResult::new(
                next,
                vec![Effect::AppendLedgerRow {
                    requested_at: request.requested_at,
                }],
            ))
        }

        (ReviewStatus::Submitted, Event::LedgerRowAppended { row }) => {
            let mut next = request.clone();
            next.ledger_row_id = Some(row);
            Ok(TransitionResult::no_change(next))
        }

        // The instructor got there while the append was in flight.
        (ReviewStatus::Reviewed, Event::LedgerRowAppended { row }) => {
            let mut next = request.clone();
            next.ledger_row_id = Some(row);
            Ok(TransitionResult::new(
                next,
                vec![Effect::UpdateLedgerStatus {
                    row,
                    status: LedgerStatus::Reviewed,
                }],
            ))
        }

        // Force-cancelled while the append was in flight: the row must not linger.
        (ReviewStatus::Cancelled, Event::LedgerRowAppended { row }) => Ok(TransitionResult::new(
            request.clone(),
            vec![Effect::DeleteLedgerRow { row }],
        )),

        (ReviewStatus::Submitted, Event::ReviewSubmitted { at, .. })
        | (
            ReviewStatus::Pending,
            Event::ReviewSubmitted {
                at,
                allow_pending: true,
            },
        ) => {
            let mut next = request.clone();
            next.status = ReviewStatus::Reviewed;
            next.reviewed_at = Some(at);

            let mut effects = unlock_effects();
            if let Some(row) = request.ledger_row_id {
                effects.push(Effect::UpdateLedgerStatus {
                    row,
                    status: LedgerStatus::Reviewed,
                });
            }
            Ok(TransitionResult::new(next, effects))
        }

        (
            ReviewStatus::Pending | ReviewStatus::Submitted | ReviewStatus::Reviewed,
            Event::ForceCancelRequested,
        ) => {
            let mut next = request.clone();
            next.status = ReviewStatus::Cancelled;
            next.ledger_row_id = None;

            let mut effects = unlock_effects();
            if let Some(row) = request.ledger_row_id {
                effects.push(Effect::DeleteLedgerRow { row });
            }
            Ok(TransitionResult::new(next, effects))
        }

        (_, event) => Err(invalid(&event)),
    }
}
