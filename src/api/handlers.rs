use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::ApiError;
use super::{get_session, parse_session_id, AppState};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Control, RegistryError, Session, SessionError, SessionId, SessionInfo};

pub(super) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub(super) struct CreatedSession {
    id: SessionId,
    name: String,
}

pub(super) async fn session_create(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreatedSession>), ApiError> {
    let id = state.sessions.create()?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            id,
            name: id.to_string(),
        }),
    ))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    Ok(Json(session.info()))
}

pub(super) async fn session_kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.sessions.dispatch(id, Control::Disconnect).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.sessions.dispatch(id, Control::Input(body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct ResizeRequest {
    rows: u16,
    cols: u16,
}

pub(super) async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    let Json(req) = req.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    state
        .sessions
        .dispatch(
            id,
            Control::Resize {
                rows: req.rows,
                cols: req.cols,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Attach the caller to a session. The upgrade spawns the terminal.
///
/// Only one socket may attach to a session; a second attempt gets 409.
pub(super) async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let session = get_session(&state.sessions, &id)?;
    if session.is_attached() {
        return Err(ApiError::SessionBusy(session.id()));
    }
    let ws = ws.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    Ok(ws
        .on_upgrade(move |socket| handle_terminal_ws(socket, session, state))
        .into_response())
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_message(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server message");
            Ok(())
        }
    }
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_terminal_ws(socket: WebSocket, session: Arc<Session>, state: AppState) {
    use axum::extract::ws::close_code;

    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The session only holds a weak reference; `output_tx` keeps the channel
    // open for as long as this socket lives.
    let (output_tx, mut output_rx) = mpsc::channel(state.channel_capacity.max(1));

    if let Err(e) = session.on_connect(&output_tx).await {
        let code = match &e {
            SessionError::Spawn(_) => "spawn_failed",
            SessionError::InvalidState { .. } => "session_busy",
            _ => "session_unavailable",
        };
        let _ = send_message(&mut ws_tx, &ServerMessage::error(code, e.to_string())).await;
        send_close(&mut ws_tx, close_code::ERROR, "terminal unavailable").await;
        return;
    }

    let id = session.id();
    tracing::debug!(session = %id, "client attached");

    let closed = session.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;

            // Terminal output -> WebSocket
            Some(msg) = output_rx.recv() => {
                let exited = matches!(msg, ServerMessage::Exit { .. });
                if send_message(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
                if exited {
                    send_close(&mut ws_tx, close_code::NORMAL, "terminal exited").await;
                    break;
                }
            }

            // WebSocket -> session
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Disconnect) => break,
                            Ok(msg) => match state.sessions.dispatch(id, msg.into()).await {
                                Ok(()) => {}
                                Err(RegistryError::NotFound(_)) => break,
                                Err(e) => {
                                    let code = match &e {
                                        RegistryError::Session(SessionError::InputOverflow { .. }) => "input_buffer_full",
                                        _ => "input_failed",
                                    };
                                    let reply = ServerMessage::error(code, e.to_string());
                                    if send_message(&mut ws_tx, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            },
                            Err(e) => {
                                let reply = ServerMessage::error(
                                    "invalid_message",
                                    format!("invalid message: {}", e),
                                );
                                if send_message(&mut ws_tx, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                }
            }

            // Shutdown signal
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %id, "WebSocket received shutdown signal, closing");
                    send_close(&mut ws_tx, close_code::NORMAL, "server shutting down").await;
                    break;
                }
            }

            // The session ended without an exit notice (I/O failure, kill)
            _ = &mut closed => {
                send_close(&mut ws_tx, close_code::NORMAL, "session closed").await;
                break;
            }
        }
    }

    session.on_disconnect().await;
    tracing::debug!(session = %id, "client detached");
}
