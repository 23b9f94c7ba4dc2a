use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::oneshot;

use super::{migrations::run_migrations, SessionStore, StoreError};
use crate::models::{Project, Session};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

fn parse_optional_datetime(value: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let last_pause_time: Option<String> = row.get("last_pause_time")?;
    let total_pause_seconds: i64 = row.get("total_pause_seconds")?;
    let duration_minutes: Option<i64> = row.get("duration_minutes")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Session {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        project_id: row.get("project_id")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        is_paused: row.get("is_paused")?,
        last_pause_time: parse_optional_datetime(last_pause_time, "last_pause_time")?,
        total_pause_seconds: to_u64(total_pause_seconds, "total_pause_seconds")?,
        duration_minutes: duration_minutes
            .map(|m| to_u64(m, "duration_minutes"))
            .transpose()?,
        notes: row.get("notes")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn row_to_project(row: &Row) -> Result<Project> {
    let created_at: String = row.get("created_at")?;
    let deleted_at: Option<String> = row.get("deleted_at")?;

    Ok(Project {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        deleted_at: parse_optional_datetime(deleted_at, "deleted_at")?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

const SESSION_COLUMNS: &str = "id, user_id, project_id, start_time, end_time, is_paused, \
     last_pause_time, total_pause_seconds, duration_minutes, notes, created_at, updated_at";

/// SQLite-backed store. All connection access happens on a dedicated worker
/// thread; async callers submit closures and await the reply, so no tokio
/// worker ever blocks on the database.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("tempo-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(
                            Err(anyhow::Error::new(err).context("failed to open SQLite database")),
                        );
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        let record = project.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, user_id, name, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.user_id,
                    record.name,
                    record.created_at.to_rfc3339(),
                    record.deleted_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .with_context(|| "failed to insert project")?;
            Ok(())
        })
        .await
        .map_err(StoreError::from)
    }

    async fn find_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<Project>, StoreError> {
        let user_id = user_id.to_string();
        let project_id = project_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT id, user_id, name, created_at, deleted_at
                 FROM projects
                 WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
                params![project_id, user_id],
                |row| Ok(row_to_project(row)),
            )
            .optional()
            .with_context(|| "failed to query project")?
            .transpose()
        })
        .await
        .map_err(StoreError::from)
    }

    async fn create_session_if_none_active(&self, session: &Session) -> Result<(), StoreError> {
        let record = session.clone();
        let inserted = self
            .execute(move |conn| {
                // The partial unique index on (user_id) WHERE end_time IS NULL
                // closes the check-then-create race; a conflict surfaces as a
                // constraint violation rather than a second open row.
                let result = conn.execute(
                    "INSERT INTO sessions (id, user_id, project_id, start_time, end_time, \
                     is_paused, last_pause_time, total_pause_seconds, duration_minutes, notes, \
                     created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        record.id,
                        record.user_id,
                        record.project_id,
                        record.start_time.to_rfc3339(),
                        record.end_time.map(|dt| dt.to_rfc3339()),
                        record.is_paused,
                        record.last_pause_time.map(|dt| dt.to_rfc3339()),
                        to_i64(record.total_pause_seconds)?,
                        record.duration_minutes.map(to_i64).transpose()?,
                        record.notes,
                        record.created_at.to_rfc3339(),
                        record.updated_at.to_rfc3339(),
                    ],
                );

                match result {
                    Ok(_) => Ok(true),
                    Err(err) if is_unique_violation(&err) => Ok(false),
                    Err(err) => Err(anyhow::Error::new(err).context("failed to insert session")),
                }
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(StoreError::ActiveSessionExists)
        }
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                |row| Ok(row_to_session(row)),
            )
            .optional()
            .with_context(|| "failed to query session")?
            .transpose()
        })
        .await
        .map_err(StoreError::from)
    }

    async fn find_active_session(&self, user_id: &str) -> Result<Option<Session>, StoreError> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE user_id = ?1 AND end_time IS NULL"
                ),
                params![user_id],
                |row| Ok(row_to_session(row)),
            )
            .optional()
            .with_context(|| "failed to query active session")?
            .transpose()
        })
        .await
        .map_err(StoreError::from)
    }

    async fn transition_session(
        &self,
        session: &Session,
        expected_paused: Option<bool>,
    ) -> Result<bool, StoreError> {
        let record = session.clone();
        self.execute(move |conn| {
            let set_clause = "UPDATE sessions
                 SET end_time = ?1,
                     is_paused = ?2,
                     last_pause_time = ?3,
                     total_pause_seconds = ?4,
                     duration_minutes = ?5,
                     notes = ?6,
                     updated_at = ?7";

            let affected = match expected_paused {
                Some(expected) => conn
                    .execute(
                        &format!(
                            "{set_clause} WHERE id = ?8 AND end_time IS NULL AND is_paused = ?9"
                        ),
                        params![
                            record.end_time.map(|dt| dt.to_rfc3339()),
                            record.is_paused,
                            record.last_pause_time.map(|dt| dt.to_rfc3339()),
                            to_i64(record.total_pause_seconds)?,
                            record.duration_minutes.map(to_i64).transpose()?,
                            record.notes,
                            record.updated_at.to_rfc3339(),
                            record.id,
                            expected,
                        ],
                    )
                    .with_context(|| "failed to transition session")?,
                None => conn
                    .execute(
                        &format!("{set_clause} WHERE id = ?8 AND end_time IS NULL"),
                        params![
                            record.end_time.map(|dt| dt.to_rfc3339()),
                            record.is_paused,
                            record.last_pause_time.map(|dt| dt.to_rfc3339()),
                            to_i64(record.total_pause_seconds)?,
                            record.duration_minutes.map(to_i64).transpose()?,
                            record.notes,
                            record.updated_at.to_rfc3339(),
                            record.id,
                        ],
                    )
                    .with_context(|| "failed to transition session")?,
            };

            Ok(affected > 0)
        })
        .await
        .map_err(StoreError::from)
    }

    async fn list_open_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE end_time IS NULL
                 ORDER BY start_time ASC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
        .map_err(StoreError::from)
    }

    async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Session>, StoreError> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_id = ?1
                 ORDER BY start_time DESC
                 LIMIT ?2"
            ))?;

            let mut rows = stmt.query(params![user_id, limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
        .map_err(StoreError::from)
    }
}
