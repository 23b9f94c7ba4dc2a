use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tokio_util::sync::CancellationToken;

use super::{FanoutGateway, TokenVerifier};
use crate::{
    lifecycle::{LifecycleError, SessionManager},
    models::Session,
};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ClientCommand {
    Start { project_id: String },
    Pause { session_id: String },
    Resume { session_id: String },
    Stop {
        session_id: String,
        notes: Option<String>,
    },
    GetActive,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl CommandReply {
    fn success(session: Option<Session>, elapsed_minutes: Option<u64>) -> Self {
        Self {
            ok: true,
            session,
            elapsed_minutes,
            error: None,
            message: None,
        }
    }

    fn failure(err: &LifecycleError) -> Self {
        Self {
            ok: false,
            session: None,
            elapsed_minutes: None,
            error: Some(err.kind()),
            message: Some(err.to_string()),
        }
    }
}

/// Accept loop for the realtime channel. Each connection is admitted with a
/// bearer credential, joined to its user's room, and then serves lifecycle
/// commands until it disconnects.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    gateway: Arc<FanoutGateway>,
    verifier: Arc<dyn TokenVerifier>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Realtime listener ready on {}",
        listener.local_addr().context("listener has no local addr")?
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("failed to accept connection")?;
                let manager = manager.clone();
                let gateway = gateway.clone();
                let verifier = verifier.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, peer, manager, gateway, verifier, cancel).await
                    {
                        warn!("Connection from {peer} ended with error: {err}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    gateway: Arc<FanoutGateway>,
    verifier: Arc<dyn TokenVerifier>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut token: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = extract_token(
            request.uri().query(),
            request
                .headers()
                .get("Authorization")
                .and_then(|value| value.to_str().ok()),
        );
        if token.is_some() {
            Ok(response)
        } else {
            let mut reject = ErrorResponse::new(Some("missing credential".to_string()));
            *reject.status_mut() = StatusCode::UNAUTHORIZED;
            Err(reject)
        }
    };

    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .context("websocket handshake failed")?;
    let token = token.context("handshake accepted without credential")?;

    let user_id = match timeout(VERIFY_TIMEOUT, verifier.verify(&token)).await {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(err)) => {
            info!("Rejected connection from {peer}: {err}");
            return Ok(());
        }
        Err(_) => {
            warn!("Credential verification timed out for {peer}");
            return Ok(());
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let connection_id = gateway.join(&user_id, outbound);
    info!("User {user_id} connected from {peer}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = outbound_rx.recv() => {
                let Some(payload) = event else { break };
                if ws_tx.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(frame))) => {
                        let reply = dispatch(&manager, &user_id, &frame).await;
                        if ws_tx.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("Read error from {peer}: {err}");
                        break;
                    }
                }
            }
        }
    }

    gateway.leave(connection_id);
    info!("User {user_id} disconnected from {peer}");
    Ok(())
}

fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    authorization
        .and_then(|header| header.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

async fn dispatch(manager: &SessionManager, user_id: &str, frame: &str) -> String {
    let reply = match serde_json::from_str::<ClientCommand>(frame) {
        Ok(command) => run_command(manager, user_id, command).await,
        Err(err) => CommandReply {
            ok: false,
            session: None,
            elapsed_minutes: None,
            error: Some("BadCommand"),
            message: Some(err.to_string()),
        },
    };

    serde_json::to_string(&reply).unwrap_or_else(|err| {
        warn!("Failed to serialize reply: {err}");
        r#"{"ok":false,"error":"Internal"}"#.to_string()
    })
}

async fn run_command(
    manager: &SessionManager,
    user_id: &str,
    command: ClientCommand,
) -> CommandReply {
    let result = match command {
        ClientCommand::Start { project_id } => manager
            .start(user_id, &project_id)
            .await
            .map(|session| (Some(session), None)),
        ClientCommand::Pause { session_id } => manager
            .pause(user_id, &session_id)
            .await
            .map(|session| (Some(session), None)),
        ClientCommand::Resume { session_id } => manager
            .resume(user_id, &session_id)
            .await
            .map(|session| (Some(session), None)),
        ClientCommand::Stop { session_id, notes } => manager
            .stop(user_id, &session_id, notes)
            .await
            .map(|session| (Some(session), None)),
        ClientCommand::GetActive => manager
            .get_active(user_id)
            .await
            .map(|active| match active {
                Some((session, elapsed)) => (Some(session), Some(elapsed)),
                None => (None, None),
            }),
    };

    match result {
        Ok((session, elapsed_minutes)) => CommandReply::success(session, elapsed_minutes),
        Err(err) => CommandReply::failure(&err),
    }
}
