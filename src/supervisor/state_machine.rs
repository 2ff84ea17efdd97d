use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(ServerStatus, ServerStatus),
}

pub struct StateMachine {
    state: ServerStatus,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ServerStatus::Closed,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServerStatus {
        self.state
    }

    pub fn can_transition(&self, to: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self.state, to),
            (Closed, Opening)
                | (Opening, Open)
                // launch failure, hang, or shutdown while starting
                | (Opening, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }

    pub fn transition(&mut self, to: ServerStatus) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("Server status: {} -> {}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    /// Moves `from -> to` only if the machine is currently in `from`.
    pub fn transition_from(&mut self, from: ServerStatus, to: ServerStatus) -> bool {
        self.state == from && self.transition(to).is_ok()
    }
}
