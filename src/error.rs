//! Crate-wide error kinds
//!
//! One enum for every error that can leave the core, carrying a kind tag and
//! a human-readable message. Adapter- and tool-level errors are mapped into
//! this enum at the boundary where they cross into the runner or the
//! transport layer; they are never allowed to panic across that boundary.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent is already processing a turn for this session")]
    AgentBusy,

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("tool validation failed: {0}")]
    ToolValidation(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation aborted")]
    AbortError,

    #[error("execution environment unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<crate::agent_fsm::InvalidTransition> for CoreError {
    fn from(err: crate::agent_fsm::InvalidTransition) -> Self {
        Self::InvalidTransition(err.to_string())
    }
}

impl CoreError {
    /// Short machine-readable tag, used in logs and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::AgentBusy => "AgentBusy",
            Self::InvalidTransition(_) => "InvalidTransition",
            Self::ToolValidation(_) => "ToolValidation",
            Self::ToolExecution(_) => "ToolExecution",
            Self::PermissionDenied => "PermissionDenied",
            Self::AbortError => "AbortError",
            Self::AdapterUnavailable(_) => "AdapterUnavailable",
            Self::Persistence(_) => "Persistence",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
