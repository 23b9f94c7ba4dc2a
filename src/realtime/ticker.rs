use std::{sync::Arc, time::Duration};

use log::warn;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    events::{EventPublisher, SessionEvent},
    lifecycle::live_active_seconds,
    store::SessionStore,
};

/// Periodic `timer:update` scheduler. Lives outside the gateway: it is just
/// another event producer, deriving elapsed time lazily from the stored
/// record on every tick, so nothing needs to survive a restart.
pub fn spawn_ticker(
    store: Arc<dyn SessionStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(tick_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let open = match store.list_open_sessions().await {
                Ok(open) => open,
                Err(err) => {
                    warn!("Ticker could not list open sessions: {err}");
                    continue;
                }
            };

            let now = clock.now();
            for session in open {
                publisher
                    .publish(
                        &session.user_id,
                        SessionEvent::TimerUpdate {
                            session_id: session.id.clone(),
                            elapsed_seconds: live_active_seconds(&session, now),
                        },
                    )
                    .await;
            }
        }
    })
}
