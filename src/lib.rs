mod clock;
mod config;
mod events;
mod lifecycle;
mod models;
mod realtime;
mod store;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServiceSettings;
pub use events::{EventEnvelope, EventPublisher, SessionEvent};
pub use lifecycle::{
    LifecycleError, SessionManager, MAX_DURATION_MINUTES, MIN_DURATION_MINUTES,
};
pub use models::{Project, Session};
pub use realtime::{
    AuthError, Bridge, ConnectionId, FanoutGateway, LoopbackHub, RelayBridge, StaticTokenVerifier,
    TokenVerifier,
};
pub use store::{MemoryStore, SessionStore, SqliteStore, StoreError};

/// Wires the store, lifecycle manager, fanout gateway, bridge, ticker, and
/// realtime listener, then serves until ctrl-c.
pub async fn run(settings: ServiceSettings) -> Result<()> {
    let store = SqliteStore::new(settings.database_path.clone())?;
    let store: Arc<dyn SessionStore> = Arc::new(store);

    let cancel = CancellationToken::new();
    let gateway = Arc::new(FanoutGateway::new());

    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    gateway.spawn_bridge_intake(intake_rx, cancel.clone());

    if let Some(url) = &settings.bridge_url {
        match RelayBridge::connect(url, intake_tx, cancel.clone()).await {
            Ok(bridge) => gateway.attach_bridge(Arc::new(bridge)),
            Err(err) => {
                warn!("Realtime bridge unavailable ({err}); continuing in single-instance mode");
            }
        }
    } else {
        info!("No bridge configured, running single-instance");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        gateway.clone(),
        clock.clone(),
    ));

    realtime::spawn_ticker(
        store,
        gateway.clone(),
        clock,
        Duration::from_secs(settings.tick_interval_secs.max(1)),
        cancel.clone(),
    );

    let verifier = Arc::new(StaticTokenVerifier::new(settings.tokens.clone()));
    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;

    let serve = realtime::serve(listener, manager, gateway, verifier, cancel.clone());
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            cancel.cancel();
        }
    }

    Ok(())
}
