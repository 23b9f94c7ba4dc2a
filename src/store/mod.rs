use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Project, Session};

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The per-user open-session uniqueness constraint rejected a create.
    #[error("an open session already exists for this user")]
    ActiveSessionExists,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence port for the lifecycle manager. Implementations must provide
/// real atomicity for `create_session_if_none_active` (the check-then-create
/// window is closed inside the store, never by the caller) and for the
/// optimistic `transition_session` compare-and-swap, because the service may
/// run as several instances sharing one backing store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_project(&self, project: &Project) -> Result<(), StoreError>;

    /// Resolves a project only when it is owned by `user_id` and not
    /// soft-deleted.
    async fn find_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<Project>, StoreError>;

    /// Inserts an open session unless the user already has one, atomically.
    /// Fails with [`StoreError::ActiveSessionExists`] when the invariant
    /// would be violated.
    async fn create_session_if_none_active(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn find_active_session(&self, user_id: &str) -> Result<Option<Session>, StoreError>;

    /// Writes the mutable column set of `session` only if the stored row is
    /// still open and, when `expected_paused` is `Some`, still has the
    /// expected pause flag. Returns `false` when no row matched, meaning a
    /// concurrent transition won the race.
    async fn transition_session(
        &self,
        session: &Session,
        expected_paused: Option<bool>,
    ) -> Result<bool, StoreError>;

    /// Every open session across all users, oldest first.
    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Session>, StoreError>;
}
