use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Bridge;
use crate::events::{EventEnvelope, EventPublisher, SessionEvent};

pub type ConnectionId = u64;

/// Outbound half of one admitted connection; the transport forwards
/// whatever arrives here to the client socket.
type Outbound = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct RoomTable {
    /// user id -> live connections for that user.
    rooms: HashMap<String, HashMap<ConnectionId, Outbound>>,
    /// reverse index so leave() only needs the connection id.
    owners: HashMap<ConnectionId, String>,
}

/// Groups connections into one multicast room per user and fans lifecycle
/// events out to them, optionally relaying through a cross-instance bridge
/// so a user's devices on other instances see the same events. Delivery is
/// best-effort and at-most-once; reconnecting clients re-fetch state.
pub struct FanoutGateway {
    instance_id: String,
    table: RwLock<RoomTable>,
    next_connection: AtomicU64,
    bridge: RwLock<Option<Arc<dyn Bridge>>>,
}

impl FanoutGateway {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            table: RwLock::new(RoomTable::default()),
            next_connection: AtomicU64::new(1),
            bridge: RwLock::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn attach_bridge(&self, bridge: Arc<dyn Bridge>) {
        *self.bridge.write().unwrap() = Some(bridge);
    }

    /// Admits an authenticated connection into the user's room.
    pub fn join(&self, user_id: &str, outbound: Outbound) -> ConnectionId {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.write().unwrap();
        table
            .rooms
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id, outbound);
        table.owners.insert(connection_id, user_id.to_string());
        debug!("Connection {connection_id} joined room for user {user_id}");
        connection_id
    }

    /// Removes a connection; the room itself is dropped with the last
    /// member so no per-user state outlives its connections.
    pub fn leave(&self, connection_id: ConnectionId) {
        let mut table = self.table.write().unwrap();
        let Some(user_id) = table.owners.remove(&connection_id) else {
            return;
        };
        if let Some(room) = table.rooms.get_mut(&user_id) {
            room.remove(&connection_id);
            if room.is_empty() {
                table.rooms.remove(&user_id);
            }
        }
        debug!("Connection {connection_id} left room for user {user_id}");
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.table
            .read()
            .unwrap()
            .rooms
            .get(user_id)
            .map_or(0, |room| room.len())
    }

    /// Spawns the task that re-delivers envelopes arriving from the bridge
    /// to this instance's local sockets.
    pub fn spawn_bridge_intake(
        self: &Arc<Self>,
        mut intake: mpsc::UnboundedReceiver<EventEnvelope>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = intake.recv() => {
                        let Some(envelope) = received else { break };
                        if envelope.origin == gateway.instance_id {
                            continue;
                        }
                        match serde_json::to_string(&envelope.event) {
                            Ok(payload) => gateway.deliver_local(&envelope.user_id, &payload),
                            Err(err) => warn!("Dropping undeliverable bridged event: {err}"),
                        }
                    }
                }
            }
        })
    }

    fn deliver_local(&self, user_id: &str, payload: &str) {
        let dead: Vec<ConnectionId> = {
            let table = self.table.read().unwrap();
            let Some(room) = table.rooms.get(user_id) else {
                return;
            };
            room.iter()
                .filter(|(_, outbound)| outbound.send(payload.to_string()).is_err())
                .map(|(id, _)| *id)
                .collect()
        };

        // Senders fail only when the transport side has gone away; reap the
        // memberships so the room table cannot leak.
        for connection_id in dead {
            self.leave(connection_id);
        }
    }
}

impl Default for FanoutGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for FanoutGateway {
    async fn publish(&self, user_id: &str, event: SessionEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping unserializable {} event: {err}", event.name());
                return;
            }
        };

        self.deliver_local(user_id, &payload);

        let bridge = self.bridge.read().unwrap().clone();
        if let Some(bridge) = bridge {
            let envelope = EventEnvelope {
                origin: self.instance_id.clone(),
                user_id: user_id.to_string(),
                event,
            };
            if let Err(err) = bridge.publish(&envelope).await {
                warn!("Bridge publish failed, delivered locally only: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::Session;

    fn started_event(user_id: &str) -> SessionEvent {
        SessionEvent::Started {
            session: Session::new_open(user_id, "p1", Utc::now()),
        }
    }

    #[tokio::test]
    async fn events_only_reach_the_affected_users_room() {
        let gateway = FanoutGateway::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        gateway.join("alice", tx_a);
        gateway.join("bob", tx_b);

        gateway.publish("alice", started_event("alice")).await;

        let delivered = rx_a.try_recv().expect("alice receives");
        assert!(delivered.contains("session:started"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_device_of_a_user_receives_the_event() {
        let gateway = FanoutGateway::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        gateway.join("alice", tx1);
        gateway.join("alice", tx2);

        gateway.publish("alice", started_event("alice")).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn last_leave_drops_the_room_entirely() {
        let gateway = FanoutGateway::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let first = gateway.join("alice", tx1);
        let second = gateway.join("alice", tx2);

        gateway.leave(first);
        assert_eq!(gateway.connection_count("alice"), 1);
        gateway.leave(second);
        assert_eq!(gateway.connection_count("alice"), 0);
        assert!(gateway.table.read().unwrap().rooms.is_empty());
        assert!(gateway.table.read().unwrap().owners.is_empty());
    }

    #[tokio::test]
    async fn dead_connections_are_reaped_on_delivery() {
        let gateway = FanoutGateway::new();
        let (tx, rx) = mpsc::unbounded_channel();
        gateway.join("alice", tx);
        drop(rx);

        gateway.publish("alice", started_event("alice")).await;
        assert_eq!(gateway.connection_count("alice"), 0);
    }

    #[tokio::test]
    async fn without_a_bridge_local_delivery_still_works() {
        // Degraded mode is simply an unattached bridge.
        let gateway = FanoutGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.join("alice", tx);

        gateway.publish("alice", started_event("alice")).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bridge_intake_skips_own_echo() {
        let gateway = Arc::new(FanoutGateway::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.join("alice", tx);

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        gateway.spawn_bridge_intake(intake_rx, cancel.clone());

        intake_tx
            .send(EventEnvelope {
                origin: gateway.instance_id().to_string(),
                user_id: "alice".into(),
                event: started_event("alice"),
            })
            .unwrap();
        intake_tx
            .send(EventEnvelope {
                origin: "another-instance".into(),
                user_id: "alice".into(),
                event: started_event("alice"),
            })
            .unwrap();

        let delivered = rx.recv().await.expect("foreign envelope delivered");
        assert!(delivered.contains("session:started"));
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
