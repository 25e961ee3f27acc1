use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("slave {0} is already registered")]
    AlreadyRegistered(String),

    #[error("slave not found: {0}")]
    SlaveNotFound(String),

    #[error("slave {0} is at task capacity")]
    SlaveAtCapacity(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {0} is not pending")]
    NotInPending(String),

    #[error("task {0} is not running")]
    NotInRunning(String),

    #[error("task {0} is already completed")]
    AlreadyCompleted(String),

    #[error("task {0} is already failed")]
    AlreadyFailed(String),

    #[error("task {0} is already stopped")]
    AlreadyStopped(String),

    #[error("task {id} cannot be {action} in state {state}")]
    InvalidState {
        id: String,
        action: &'static str,
        state: hive_model::TaskState,
    },

    #[error("no slaves available")]
    NoSlavesAvailable,

    #[error("total weight of selected slaves is zero")]
    ZeroTotalWeight,

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Returns `true` for errors caused by an unknown slave or task ID.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::SlaveNotFound(_) | CoreError::TaskNotFound(_))
    }

    /// Returns `true` for rejected state-machine edges.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            CoreError::NotInPending(_)
                | CoreError::NotInRunning(_)
                | CoreError::AlreadyCompleted(_)
                | CoreError::AlreadyFailed(_)
                | CoreError::AlreadyStopped(_)
                | CoreError::InvalidState { .. }
        )
    }
}
