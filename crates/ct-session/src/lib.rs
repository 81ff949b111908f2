//! Per-chain session control over the live rule tables.

pub mod confirm;
pub mod controller;
pub mod error;
pub mod state;

pub use confirm::{Confirmation, ConfirmationGuard, enter_pressed};
pub use controller::{ChainSnapshot, DEFAULT_UNDO_DEPTH, MutationOutcome, SessionController};
pub use error::SessionError;
pub use state::{IllegalTransition, ViewState};
