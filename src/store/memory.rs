use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{SessionStore, StoreError};
use crate::models::{Project, Session};

#[derive(Default)]
struct MemoryInner {
    projects: HashMap<String, Project>,
    sessions: HashMap<String, Session>,
}

/// In-memory store for tests and embedders. A single mutex is the
/// atomicity primitive: both the one-open-session check-and-insert and the
/// compare-and-swap transition happen entirely under the lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn find_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<Project>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .projects
            .get(project_id)
            .filter(|p| p.user_id == user_id && !p.is_deleted())
            .cloned())
    }

    async fn create_session_if_none_active(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let has_open = inner
            .sessions
            .values()
            .any(|s| s.user_id == session.user_id && s.is_open());
        if has_open {
            return Err(StoreError::ActiveSessionExists);
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn find_active_session(&self, user_id: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .find(|s| s.user_id == user_id && s.is_open())
            .cloned())
    }

    async fn transition_session(
        &self,
        session: &Session,
        expected_paused: Option<bool>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(current) = inner.sessions.get_mut(&session.id) else {
            return Ok(false);
        };

        if !current.is_open() {
            return Ok(false);
        }
        if let Some(expected) = expected_paused {
            if current.is_paused != expected {
                return Ok(false);
            }
        }

        *current = session.clone();
        Ok(true)
    }

    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut open: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.start_time);
        Ok(open)
    }

    async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions.truncate(limit as usize);
        Ok(sessions)
    }
}
