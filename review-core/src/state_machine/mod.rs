//! Pure state machine for the review request lifecycle.
//!
//! The design separates:
//! - **State**: the durable `ReviewRequest` record
//! - **Events**: what happened (`Event`)
//! - **Effects**: what to do about it (`Effect`)
//! - **Transition**: pure function `(ReviewRequest, Event) -> (ReviewRequest, Vec<Effect>)`
//!
//! The server's interpreter executes effects against Gitea and the ledger and feeds
//! result events back through `transition`.

pub mod effect;
pub mod event;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use transition::*;
