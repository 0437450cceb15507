//! Effects (side effects as data).
//!
//! Effects describe what should happen on Gitea or in the ledger as a result of a
//! transition. They are pure data; the server interprets them best-effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AccessLevel, LedgerRowId, LedgerStatus};

/// All effects that can be produced by review transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    // =========================================================================
    // Gitea Effects
    // =========================================================================
    /// Change the student's collaborator permission on their repository.
    SetCollaboratorAccess { level: AccessLevel },

    /// Block pushes to the protected branch.
    EnableBranchProtection,

    /// Lift the branch protection installed by `EnableBranchProtection`.
    DisableBranchProtection,

    // =========================================================================
    // Ledger Effects
    // =========================================================================
    /// Append a row to the review queue. Produces `Event::LedgerRowAppended`.
    AppendLedgerRow { requested_at: DateTime<Utc> },

    /// Rewrite the status cell of an existing row.
    UpdateLedgerStatus {
        row: LedgerRowId,
        status: LedgerStatus,
    },

    /// Remove a row from the review queue.
    DeleteLedgerRow { row: LedgerRowId },
}

/// Effects that lock the student's repository while a request is under review.
pub fn lock_effects() -> Vec<Effect> {
    vec![
        Effect::SetCollaboratorAccess {
            level: AccessLevel::Read,
        },
        Effect::EnableBranchProtection,
    ]
}

/// Effects that hand the repository back to the student.
pub fn unlock_effects() -> Vec<Effect> {
    vec![
        Effect::DisableBranchProtection,
        Effect::SetCollaboratorAccess {
            level: AccessLevel::Write,
        },
    ]
}
