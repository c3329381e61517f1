//! The core's error taxonomy (§7).
//!
//! Every variant maps to a stable JSON-RPC error code via [`CoreError::code`],
//! matching the wire contract in §6.3. Internal callers match on the enum;
//! the transport only ever sees `code()` and `to_string()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("agent not registered: {0}")]
    NotRegistered(String),

    #[error("agent {agent_id} is not assigned task {task_id}")]
    NotAssigned { agent_id: String, task_id: String },

    #[error("lease for task {task_id} has expired")]
    LeaseExpired { task_id: String },

    #[error("board unavailable: {0}")]
    BoardUnavailable(String),

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("circular dependency detected among mandatory edges: {0}")]
    CircularDependencyError(String),

    #[error("ledger write failed: {0}")]
    LedgerWriteError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable JSON-RPC error code for the transport (§6.3).
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => -32001,
            Self::NotRegistered(_) => -32002,
            Self::NotAssigned { .. } => -32003,
            Self::LeaseExpired { .. } => -32004,
            Self::BoardUnavailable(_) => -32005,
            Self::OracleUnavailable(_) => -32006,
            Self::CircularDependencyError(_) => -32007,
            Self::LedgerWriteError(_) => -32008,
            Self::Internal(_) => -32000,
        }
    }

    /// Whether the surrounding operation may be retried by the caller
    /// without any other state change (§7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BoardUnavailable(_) | Self::OracleUnavailable(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
