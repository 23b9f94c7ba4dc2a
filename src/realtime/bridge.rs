use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::events::EventEnvelope;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cross-instance publish side. Subscription is wired at construction: each
/// adapter forwards envelopes from the shared bus into the gateway's intake
/// channel. Losing the bridge narrows delivery to local sockets; it never
/// takes the service down.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// In-process bus connecting several gateways inside one process. Used by
/// tests and single-binary multi-gateway setups.
pub struct LoopbackHub {
    bus: broadcast::Sender<EventEnvelope>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(256);
        Self { bus }
    }

    /// Creates a bridge endpoint whose subscription feeds `intake`.
    pub fn endpoint(
        &self,
        intake: mpsc::UnboundedSender<EventEnvelope>,
        cancel: CancellationToken,
    ) -> LoopbackBridge {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(envelope) => {
                            if intake.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Loopback bridge dropped {skipped} envelopes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        LoopbackBridge {
            bus: self.bus.clone(),
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackBridge {
    bus: broadcast::Sender<EventEnvelope>,
}

#[async_trait]
impl Bridge for LoopbackBridge {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        self.bus
            .send(envelope.clone())
            .map_err(|_| anyhow!("loopback bus has no subscribers"))?;
        Ok(())
    }
}

/// WebSocket client to a shared relay. The relay re-broadcasts every frame
/// to all connected instances; origin filtering happens at intake.
pub struct RelayBridge {
    outbound: mpsc::UnboundedSender<EventEnvelope>,
}

impl RelayBridge {
    /// Connects to the relay and wires its frames into `intake`. Callers
    /// treat a failure here as entering degraded (single-instance) mode.
    pub async fn connect(
        url: &str,
        intake: mpsc::UnboundedSender<EventEnvelope>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| anyhow!("relay connect timed out"))?
            .with_context(|| format!("failed to connect to relay {url}"))?;
        info!("Connected to realtime relay at {url}");

        let (mut writer, mut reader) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<EventEnvelope>();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = outbound_rx.recv() => {
                        let Some(envelope) = next else { break };
                        let frame = match serde_json::to_string(&envelope) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!("Skipping unserializable relay envelope: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = writer.send(Message::Text(frame)).await {
                            warn!("Relay write failed, cross-instance delivery degraded: {err}");
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = reader.next() => {
                        let Some(message) = next else {
                            warn!("Relay connection closed, running single-instance");
                            break;
                        };
                        match message {
                            Ok(Message::Text(frame)) => {
                                match serde_json::from_str::<EventEnvelope>(&frame) {
                                    Ok(envelope) => {
                                        if intake.send(envelope).is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => warn!("Ignoring malformed relay frame: {err}"),
                                }
                            }
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                            Ok(Message::Close(_)) => {
                                warn!("Relay closed the connection, running single-instance");
                                break;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!("Relay read failed, running single-instance: {err}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { outbound })
    }
}

#[async_trait]
impl Bridge for RelayBridge {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        self.outbound
            .send(envelope.clone())
            .map_err(|_| anyhow!("relay connection lost"))
    }
}
