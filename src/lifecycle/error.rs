use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("project not found")]
    ProjectNotFound,
    #[error("user already has an active session; stop it first")]
    ActiveSessionConflict,
    #[error("session not found")]
    SessionNotFound,
    #[error("session is already paused")]
    AlreadyPaused,
    #[error("session is not paused")]
    NotPaused,
    #[error("session is already stopped")]
    AlreadyStopped,
    #[error("computed duration of {minutes} minutes is out of range")]
    DurationOutOfRange { minutes: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Stable wire identifier for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::ProjectNotFound => "ProjectNotFound",
            LifecycleError::ActiveSessionConflict => "ActiveSessionConflict",
            LifecycleError::SessionNotFound => "SessionNotFound",
            LifecycleError::AlreadyPaused => "AlreadyPaused",
            LifecycleError::NotPaused => "NotPaused",
            LifecycleError::AlreadyStopped => "AlreadyStopped",
            LifecycleError::DurationOutOfRange { .. } => "DurationOutOfRange",
            LifecycleError::Store(_) => "StoreFailure",
        }
    }
}
