//! Session context and the lifecycle state machine.
//!
//! A session moves strictly forward: `Joining -> Active -> Ended`. There are
//! no recovery transitions; a join that fails never becomes active.

use crate::{agent_config::AgentConfig, metadata::RoomMetadata};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Active,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Joining => write!(f, "joining"),
            SessionState::Active => write!(f, "active"),
            SessionState::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid session transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Validates a transition and returns the new state.
    pub fn transition(self, to: SessionState) -> Result<SessionState, TransitionError> {
        match (self, to) {
            (SessionState::Joining, SessionState::Active)
            | (SessionState::Joining, SessionState::Ended)
            | (SessionState::Active, SessionState::Ended) => Ok(to),
            (from, to) => Err(TransitionError { from, to }),
        }
    }
}

/// Everything the worker knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub agent_id: String,
    pub session_id: String,
    pub config: AgentConfig,
}

impl SessionContext {
    pub fn new(metadata: RoomMetadata, config: AgentConfig) -> Self {
        Self {
            agent_id: metadata.agent_id,
            session_id: metadata.session_id,
            config,
        }
    }
}
