//! WebSocket observer handler
//!
//! Connection lifecycle: authenticate, send `auth`, send one full
//! `state-update` snapshot, then relay. The broadcast subscription is
//! created before the snapshot is read, so a transition can be delivered
//! twice across that boundary but never lost. Observers that lag behind
//! the broadcast buffer get resynchronized with a fresh snapshot.
//!
//! Any per-socket error tears down that observer only.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use encore_common::protocol::{ClientMessage, ServerMessage};

use super::server::AppContext;
use crate::coordinator::CoordinatorMsg;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let authorized = token_matches(ctx.token.as_deref(), &headers, query.token.as_deref());
    ws.on_upgrade(move |socket| handle_observer(socket, ctx, authorized))
}

/// Token from `Authorization: Bearer` or the `token` query parameter.
fn token_matches(required: Option<&str>, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(required) = required else {
        return true;
    };
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    header_token == Some(required) || query_token == Some(required)
}

async fn handle_observer(mut socket: WebSocket, ctx: AppContext, authorized: bool) {
    if !authorized {
        warn!("rejecting observer with missing or invalid token");
        let _ = send(
            &mut socket,
            &ServerMessage::Auth {
                success: false,
                message: Some("invalid token".into()),
            },
        )
        .await;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    }

    if send(
        &mut socket,
        &ServerMessage::Auth {
            success: true,
            message: None,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    // Subscribe before reading the snapshot: the observer may see one
    // transition twice, but never misses one.
    let mut updates = ctx.hub.subscribe();
    let snapshot = ctx.snapshot.read().await.clone();
    if send(&mut socket, &ServerMessage::StateUpdate { state: snapshot })
        .await
        .is_err()
    {
        return;
    }
    info!(observers = ctx.hub.observer_count(), "observer connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => {
                    if send(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged, resynchronizing");
                    let snapshot = ctx.snapshot.read().await.clone();
                    if send(&mut socket, &ServerMessage::StateUpdate { state: snapshot })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch(&ctx, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("observer socket error: {e}");
                    break;
                }
            },
        }
    }
    debug!("observer disconnected");
}

/// Parse one client message and forward it. Unparseable input is dropped,
/// never answered with an error.
async fn dispatch(ctx: &AppContext, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Command { action }) => {
            if ctx
                .command_tx
                .send(CoordinatorMsg::Command(action))
                .await
                .is_err()
            {
                warn!("coordinator is gone, dropping command");
            }
        }
        Ok(ClientMessage::ConfigUpdate { config }) => {
            let _ = ctx.command_tx.send(CoordinatorMsg::ConfigUpdate(config)).await;
        }
        Ok(ClientMessage::Detach) => {
            let _ = ctx.command_tx.send(CoordinatorMsg::Detach).await;
        }
        Err(e) => debug!("dropping unparseable client message: {e}"),
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}
