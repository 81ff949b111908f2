use crate::state::{IllegalTransition, ViewState};
use ct_core::{ChainKey, ExecutionError, StalePositionError, UndoError, ValidationError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] ct_core::Error),

    #[error("{key} is {state}; refresh it before {operation}")]
    NotReady {
        key: ChainKey,
        state: ViewState,
        operation: &'static str,
    },

    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    #[error(transparent)]
    Undo(#[from] UndoError),
}

impl SessionError {
    pub fn stale_position(&self) -> Option<&StalePositionError> {
        match self {
            SessionError::Engine(ct_core::Error::StalePosition(e)) => Some(e),
            _ => None,
        }
    }

    pub fn execution(&self) -> Option<&ExecutionError> {
        match self {
            SessionError::Engine(ct_core::Error::Execution(e)) => Some(e),
            _ => None,
        }
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            SessionError::Engine(ct_core::Error::Validation(e)) => Some(e),
            _ => None,
        }
    }
}

impl From<StalePositionError> for SessionError {
    fn from(e: StalePositionError) -> Self {
        SessionError::Engine(e.into())
    }
}

impl From<ValidationError> for SessionError {
    fn from(e: ValidationError) -> Self {
        SessionError::Engine(e.into())
    }
}
