use thiserror::Error;

use crate::protocol::ErrorCode;

/// Caller-visible failures of the leader write path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("not the leader")]
    NotLeader { leader: Option<String> },

    #[error("not enough replicas")]
    NotEnoughReplicas,
}

impl WriteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WriteError::NotLeader { .. } => ErrorCode::NotLeader,
            WriteError::NotEnoughReplicas => ErrorCode::NotEnoughReplicas,
        }
    }
}
