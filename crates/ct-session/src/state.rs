use serde::Serialize;
use std::fmt;

/// Lifecycle of one (table, chain) view.
///
/// ```text
/// Idle -> Loading -> Ready -> Mutating -> Loading
///   any -> Error -> Loading
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewState {
    #[default]
    Idle,
    Loading,
    Ready,
    Mutating,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal view transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ViewState,
    pub to: ViewState,
}

impl ViewState {
    pub fn can_transition(self, to: ViewState) -> bool {
        use ViewState::*;
        matches!(
            (self, to),
            (Idle, Loading)
                | (Loading, Ready)
                | (Ready, Loading)
                | (Ready, Mutating)
                | (Mutating, Loading)
                | (Error, Loading)
                | (_, Error)
        )
    }

    pub fn transition(&mut self, to: ViewState) -> Result<(), IllegalTransition> {
        if !self.can_transition(to) {
            return Err(IllegalTransition { from: *self, to });
        }
        tracing::trace!(from = %self, %to, "view transition");
        *self = to;
        Ok(())
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewState::Idle => "idle",
            ViewState::Loading => "loading",
            ViewState::Ready => "ready",
            ViewState::Mutating => "mutating",
            ViewState::Error => "error",
        };
        f.write_str(name)
    }
}
