use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A focus session. `end_time == None` means the session is open (running
/// or paused); once `end_time` is set the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_paused: bool,
    pub last_pause_time: Option<DateTime<Utc>>,
    /// Seconds accumulated from pause intervals that have already closed.
    /// An open pause interval is not included until resume/stop folds it in.
    pub total_pause_seconds: u64,
    pub duration_minutes: Option<u64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_open(user_id: &str, project_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            start_time: started_at,
            end_time: None,
            is_paused: false,
            last_pause_time: None,
            total_pause_seconds: 0,
            duration_minutes: None,
            notes: None,
            created_at: started_at,
            updated_at: started_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}
