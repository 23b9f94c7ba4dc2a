use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::info;

use super::LifecycleError;
use crate::{
    clock::Clock,
    events::{EventPublisher, SessionEvent},
    models::Session,
    store::{SessionStore, StoreError},
};

pub const MIN_DURATION_MINUTES: u64 = 1;
pub const MAX_DURATION_MINUTES: u64 = 1440;

/// Rounds a duration to the nearest whole second, clamping negatives to
/// zero to tolerate clock skew between transitions issued back to back.
fn round_seconds(elapsed: Duration) -> u64 {
    let ms = elapsed.num_milliseconds().max(0);
    ((ms + 500) / 1000) as u64
}

fn round_minutes(seconds: i64) -> u64 {
    let seconds = seconds.max(0);
    ((seconds + 30) / 60) as u64
}

/// Seconds of paused time counted as of `now`: closed pause intervals plus
/// the still-open one when the session is currently paused.
fn live_pause_seconds(session: &Session, now: DateTime<Utc>) -> u64 {
    let open_pause = match (session.is_paused, session.last_pause_time) {
        (true, Some(paused_at)) => round_seconds(now - paused_at),
        _ => 0,
    };
    session.total_pause_seconds + open_pause
}

/// Active (non-paused) seconds elapsed as of `now`, derived entirely from
/// the stored record. There is no running timer to drift or to lose across
/// restarts.
pub fn live_active_seconds(session: &Session, now: DateTime<Utc>) -> u64 {
    let raw = round_seconds(now - session.start_time) as i64;
    let paused = live_pause_seconds(session, now) as i64;
    (raw - paused).max(0) as u64
}

pub fn live_elapsed_minutes(session: &Session, now: DateTime<Utc>) -> u64 {
    round_minutes(live_active_seconds(session, now) as i64)
}

/// Owns the session state machine. The only writer of session records;
/// serialization of concurrent transitions is delegated to the store's
/// atomic primitives, never to an in-process lock, so the service can run
/// as multiple instances over one backing store.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    pub async fn start(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Session, LifecycleError> {
        self.store
            .find_project(user_id, project_id)
            .await?
            .ok_or(LifecycleError::ProjectNotFound)?;

        let session = Session::new_open(user_id, project_id, self.clock.now());
        match self.store.create_session_if_none_active(&session).await {
            Ok(()) => {}
            Err(StoreError::ActiveSessionExists) => {
                return Err(LifecycleError::ActiveSessionConflict)
            }
            Err(err) => return Err(err.into()),
        }

        info!("Started session {} for user {user_id}", session.id);
        self.events
            .publish(
                user_id,
                SessionEvent::Started {
                    session: session.clone(),
                },
            )
            .await;
        Ok(session)
    }

    pub async fn pause(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session, LifecycleError> {
        let mut session = self.open_owned_session(user_id, session_id).await?;
        if session.is_paused {
            return Err(LifecycleError::AlreadyPaused);
        }

        let now = self.clock.now();
        session.is_paused = true;
        session.last_pause_time = Some(now);
        session.updated_at = now;

        if !self
            .store
            .transition_session(&session, Some(false))
            .await?
        {
            return Err(self
                .classify_lost_race(user_id, session_id, LifecycleError::AlreadyPaused)
                .await?);
        }

        info!("Paused session {session_id} for user {user_id}");
        self.events
            .publish(
                user_id,
                SessionEvent::Paused {
                    session: session.clone(),
                },
            )
            .await;
        Ok(session)
    }

    pub async fn resume(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session, LifecycleError> {
        let mut session = self.open_owned_session(user_id, session_id).await?;
        if !session.is_paused {
            return Err(LifecycleError::NotPaused);
        }

        let now = self.clock.now();
        close_open_pause(&mut session, now);
        session.updated_at = now;

        if !self.store.transition_session(&session, Some(true)).await? {
            return Err(self
                .classify_lost_race(user_id, session_id, LifecycleError::NotPaused)
                .await?);
        }

        info!("Resumed session {session_id} for user {user_id}");
        self.events
            .publish(
                user_id,
                SessionEvent::Resumed {
                    session: session.clone(),
                },
            )
            .await;
        Ok(session)
    }

    pub async fn stop(
        &self,
        user_id: &str,
        session_id: &str,
        notes: Option<String>,
    ) -> Result<Session, LifecycleError> {
        let mut session = self
            .store
            .find_session(session_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(LifecycleError::SessionNotFound)?;
        if !session.is_open() {
            return Err(LifecycleError::AlreadyStopped);
        }

        let now = self.clock.now();
        // All of this mutates a local copy only; nothing is persisted until
        // the duration has passed validation, so a rejected stop leaves the
        // session open and untouched for a later retry.
        close_open_pause(&mut session, now);

        let raw_elapsed = round_seconds(now - session.start_time) as i64;
        let active_elapsed = raw_elapsed - session.total_pause_seconds as i64;
        let minutes = round_minutes(active_elapsed);
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
            return Err(LifecycleError::DurationOutOfRange { minutes });
        }

        session.end_time = Some(now);
        session.duration_minutes = Some(minutes);
        session.notes = notes;
        session.updated_at = now;

        if !self.store.transition_session(&session, None).await? {
            return Err(self
                .classify_lost_race(user_id, session_id, LifecycleError::AlreadyStopped)
                .await?);
        }

        info!("Stopped session {session_id} for user {user_id} ({minutes} min)");
        self.events
            .publish(
                user_id,
                SessionEvent::Stopped {
                    session: session.clone(),
                },
            )
            .await;
        Ok(session)
    }

    /// Returns the user's open session, if any, with elapsed active minutes
    /// reconstructed as of now.
    pub async fn get_active(
        &self,
        user_id: &str,
    ) -> Result<Option<(Session, u64)>, LifecycleError> {
        let Some(session) = self.store.find_active_session(user_id).await? else {
            return Ok(None);
        };
        let elapsed = live_elapsed_minutes(&session, self.clock.now());
        Ok(Some((session, elapsed)))
    }

    pub async fn recent(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Session>, LifecycleError> {
        Ok(self.store.list_recent_sessions(user_id, limit).await?)
    }

    async fn open_owned_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session, LifecycleError> {
        self.store
            .find_session(session_id)
            .await?
            .filter(|s| s.user_id == user_id && s.is_open())
            .ok_or(LifecycleError::SessionNotFound)
    }

    /// An optimistic transition matched no row: a concurrent transition won.
    /// Re-read once and surface the precise state error; `fallback` covers
    /// the window where the row moved again between write and re-read.
    async fn classify_lost_race(
        &self,
        user_id: &str,
        session_id: &str,
        fallback: LifecycleError,
    ) -> Result<LifecycleError, LifecycleError> {
        let Some(current) = self
            .store
            .find_session(session_id)
            .await?
            .filter(|s| s.user_id == user_id)
        else {
            return Ok(LifecycleError::SessionNotFound);
        };

        if !current.is_open() {
            return Ok(LifecycleError::AlreadyStopped);
        }
        if current.is_paused {
            return Ok(LifecycleError::AlreadyPaused);
        }
        Ok(fallback)
    }
}

/// Folds the currently open pause interval (if any) into
/// `total_pause_seconds` and leaves the session un-paused.
fn close_open_pause(session: &mut Session, now: DateTime<Utc>) {
    if let (true, Some(paused_at)) = (session.is_paused, session.last_pause_time) {
        session.total_pause_seconds += round_seconds(now - paused_at);
    }
    session.is_paused = false;
    session.last_pause_time = None;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::task::JoinSet;

    use super::*;
    use crate::{
        clock::ManualClock,
        models::Project,
        store::MemoryStore,
    };

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, SessionEvent)>>,
    }

    impl RecordingPublisher {
        fn names_for(&self, user_id: &str) -> Vec<&'static str> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(user, _)| user == user_id)
                .map(|(_, event)| event.name())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, user_id: &str, event: SessionEvent) {
            self.published
                .lock()
                .unwrap()
                .push((user_id.to_string(), event));
        }
    }

    struct Fixture {
        manager: Arc<SessionManager>,
        clock: Arc<ManualClock>,
        events: Arc<RecordingPublisher>,
        store: Arc<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingPublisher::default());

        store
            .create_project(&Project {
                id: "p1".into(),
                user_id: "u1".into(),
                name: "deep work".into(),
                created_at: clock.now(),
                deleted_at: None,
            })
            .await
            .unwrap();

        let manager = Arc::new(SessionManager::new(
            store.clone(),
            events.clone(),
            clock.clone(),
        ));
        Fixture {
            manager,
            clock,
            events,
            store,
        }
    }

    #[tokio::test]
    async fn start_rejects_unknown_or_foreign_project() {
        let fx = fixture().await;

        let err = fx.manager.start("u1", "nope").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProjectNotFound));

        // Another user cannot start against u1's project.
        let err = fx.manager.start("u2", "p1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProjectNotFound));
    }

    #[tokio::test]
    async fn start_rejects_soft_deleted_project() {
        let fx = fixture().await;
        fx.store
            .create_project(&Project {
                id: "gone".into(),
                user_id: "u1".into(),
                name: "old".into(),
                created_at: fx.clock.now(),
                deleted_at: Some(fx.clock.now()),
            })
            .await
            .unwrap();

        let err = fx.manager.start("u1", "gone").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProjectNotFound));
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one_session() {
        let fx = fixture().await;

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let manager = fx.manager.clone();
            tasks.spawn(async move { manager.start("u1", "p1").await });
        }

        let mut successes = 0;
        let mut conflicts = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => successes += 1,
                Err(LifecycleError::ActiveSessionConflict) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn pause_resume_accounting_matches_wall_clock() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::seconds(10));
        fx.manager.pause("u1", &session.id).await.unwrap();

        fx.clock.advance(Duration::seconds(30));
        let resumed = fx.manager.resume("u1", &session.id).await.unwrap();
        assert_eq!(resumed.total_pause_seconds, 30);
        assert!(!resumed.is_paused);
        assert!(resumed.last_pause_time.is_none());

        fx.clock.advance(Duration::seconds(30));
        let stopped = fx.manager.stop("u1", &session.id, None).await.unwrap();
        // 70s wall, 30s paused -> 40s active -> rounds to 1 minute.
        assert_eq!(stopped.total_pause_seconds, 30);
        assert_eq!(stopped.duration_minutes, Some(1));
        assert!(stopped.end_time.is_some());
    }

    #[tokio::test]
    async fn stop_while_paused_folds_the_open_interval() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::seconds(120));
        fx.manager.pause("u1", &session.id).await.unwrap();

        fx.clock.advance(Duration::seconds(45));
        let stopped = fx.manager.stop("u1", &session.id, None).await.unwrap();

        assert_eq!(stopped.total_pause_seconds, 45);
        assert!(!stopped.is_paused);
        assert!(stopped.last_pause_time.is_none());
        // 165s wall minus 45s paused = 120s active = 2 minutes.
        assert_eq!(stopped.duration_minutes, Some(2));
    }

    #[tokio::test]
    async fn immediate_stop_is_rejected_and_session_stays_open() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::seconds(5));
        let err = fx.manager.stop("u1", &session.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::DurationOutOfRange { minutes: 0 }
        ));

        // The rejected stop wrote nothing: the session is still open and a
        // later stop succeeds once enough time has accrued.
        let (active, _) = fx.manager.get_active("u1").await.unwrap().unwrap();
        assert_eq!(active.id, session.id);
        assert!(active.is_open());
        assert_eq!(active.total_pause_seconds, 0);

        fx.clock.advance(Duration::seconds(55));
        let stopped = fx.manager.stop("u1", &session.id, None).await.unwrap();
        assert_eq!(stopped.duration_minutes, Some(1));
    }

    #[tokio::test]
    async fn stop_rejects_sessions_beyond_the_duration_ceiling() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::hours(25));
        let err = fx.manager.stop("u1", &session.id, None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DurationOutOfRange { .. }));

        assert!(fx.manager.get_active("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn double_stop_reports_already_stopped() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::minutes(10));
        let stopped = fx.manager.stop("u1", &session.id, None).await.unwrap();

        let err = fx.manager.stop("u1", &session.id, None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyStopped));

        // end_time was not rewritten by the failed second stop.
        let reloaded = fx.store.find_session(&session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.end_time, stopped.end_time);
    }

    #[tokio::test]
    async fn pause_and_resume_enforce_the_state_machine() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        let err = fx.manager.resume("u1", &session.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotPaused));

        fx.manager.pause("u1", &session.id).await.unwrap();
        let err = fx.manager.pause("u1", &session.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyPaused));

        // A session owned by someone else is indistinguishable from a
        // missing one.
        let err = fx.manager.pause("u2", &session.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::SessionNotFound));
    }

    #[tokio::test]
    async fn get_active_reconstructs_elapsed_lazily() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::minutes(5));
        let (_, elapsed) = fx.manager.get_active("u1").await.unwrap().unwrap();
        assert_eq!(elapsed, 5);

        // Repeated reads with a frozen clock never drift.
        for _ in 0..5 {
            let (_, again) = fx.manager.get_active("u1").await.unwrap().unwrap();
            assert_eq!(again, 5);
        }

        // While paused, the open pause interval is excluded live.
        fx.manager.pause("u1", &session.id).await.unwrap();
        fx.clock.advance(Duration::minutes(3));
        let (_, while_paused) = fx.manager.get_active("u1").await.unwrap().unwrap();
        assert_eq!(while_paused, 5);
    }

    #[tokio::test]
    async fn get_active_returns_none_without_an_open_session() {
        let fx = fixture().await;
        assert!(fx.manager.get_active("u1").await.unwrap().is_none());

        let session = fx.manager.start("u1", "p1").await.unwrap();
        fx.clock.advance(Duration::minutes(2));
        fx.manager.stop("u1", &session.id, None).await.unwrap();
        assert!(fx.manager.get_active("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifecycle_emits_events_in_transition_order() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();

        fx.clock.advance(Duration::minutes(2));
        fx.manager.pause("u1", &session.id).await.unwrap();
        fx.clock.advance(Duration::seconds(30));
        fx.manager.resume("u1", &session.id).await.unwrap();
        fx.clock.advance(Duration::minutes(1));
        fx.manager.stop("u1", &session.id, Some("review".into())).await.unwrap();

        assert_eq!(
            fx.events.names_for("u1"),
            vec![
                "session:started",
                "session:paused",
                "session:resumed",
                "session:stopped"
            ]
        );

        // A rejected operation emits nothing.
        let before = fx.events.published.lock().unwrap().len();
        let _ = fx.manager.stop("u1", &session.id, None).await.unwrap_err();
        assert_eq!(fx.events.published.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn notes_are_only_recorded_at_stop() {
        let fx = fixture().await;
        let session = fx.manager.start("u1", "p1").await.unwrap();
        assert!(session.notes.is_none());

        fx.clock.advance(Duration::minutes(3));
        let stopped = fx
            .manager
            .stop("u1", &session.id, Some("standup prep".into()))
            .await
            .unwrap();
        assert_eq!(stopped.notes.as_deref(), Some("standup prep"));
    }

    #[test]
    fn rounding_is_half_up_and_clamped() {
        assert_eq!(round_seconds(Duration::milliseconds(1499)), 1);
        assert_eq!(round_seconds(Duration::milliseconds(1500)), 2);
        assert_eq!(round_seconds(Duration::milliseconds(-250)), 0);

        assert_eq!(round_minutes(29), 0);
        assert_eq!(round_minutes(30), 1);
        assert_eq!(round_minutes(-10), 0);
    }
}
