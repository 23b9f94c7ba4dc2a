use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Projects are managed by an external CRUD surface; the core only needs
/// enough of the record to validate ownership at session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
