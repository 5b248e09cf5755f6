// WebSocket endpoint
// Pumps socket frames into the session state machine and session output
// back onto the socket.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::session::Session;
use crate::{AppState, SessionOutput};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session_socket(socket, state))
}

async fn session_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionOutput>();
    let mut session = Session::new(state, tx);
    session.on_connect();

    loop {
        tokio::select! {
            output = rx.recv() => match output {
                Some(SessionOutput::Frame(frame)) => {
                    let payload = match serde_json::to_string(&frame) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize frame");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Some(SessionOutput::ExecutionFinished) => session.on_execution_finished(),
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(&text).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary and protocol-level ping/pong ignored
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive error");
                    break;
                }
            },
        }
    }

    session.on_disconnect().await;
}
