//! The WebSocket transport adapter: one task per connection dispatching the
//! inbound client events and pumping outbound [`ServerEvent`]s back out.
//!
//! Grounded on the teacher's `poem` `Route`/`Server` setup in `main.rs`,
//! adapted from a streamable-HTTP MCP endpoint to a WebSocket endpoint.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket};
use poem::web::{Data, Query};
use poem::{IntoResponse, handler};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::executor::CommandExecutor;
use crate::janitor::Janitor;
use crate::orchestrator::{ConnectRequest, Orchestrator};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::queue::CommandQueue;
use crate::session::Registry;

pub fn encode_bytes(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_bytes(data: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD.decode(data).unwrap_or_default()
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub queue: Arc<CommandQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub executor: Arc<CommandExecutor>,
    pub janitor: Arc<Janitor>,
}

#[derive(serde::Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[handler]
pub fn ws_handler(ws: WebSocket, Data(state): Data<&AppState>, Query(query): Query<ConnectQuery>) -> impl IntoResponse {
    let state = state.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.session_id))
}

async fn handle_connection(socket: poem::web::websocket::WebSocketStream, state: AppState, reconnect_session_id: Option<String>) {
    let transport_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();

    if let Some(session_id) = reconnect_session_id.as_deref()
        && let Some(session) = state.registry.get(session_id)
    {
        state.registry.bind(&transport_id, session_id).await;
        session.set_output(out_tx.clone()).await;
        let _ = out_tx.send(ServerEvent::ConnectionExists {
            message: "reattached to existing session".to_string(),
            session_id: session.session_id.clone(),
        });
    }

    let writer_transport_id = transport_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else { continue };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = writer_transport_id;
    });

    let heartbeat_tx = out_tx.clone();
    let heartbeat_cancel = tokio_util::sync::CancellationToken::new();
    let heartbeat_cancel_clone = heartbeat_cancel.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(crate::config::DEFAULT_HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = heartbeat_cancel_clone.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = heartbeat_tx.send(ServerEvent::Heartbeat { timestamp: chrono::Utc::now().timestamp() });
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
            let _ = out_tx.send(ServerEvent::Error { message: "unrecognized message".to_string() });
            continue;
        };
        dispatch(&state, &transport_id, parsed, &out_tx).await;
    }

    // Transport-level disconnect: stop the heartbeat only, never tear down
    // the Session. Cleanup is left to the Janitor or an explicit Disconnect.
    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;
    state.registry.unbind(&transport_id);
    writer_task.abort();
    info!(transport_id, "transport disconnected");
}

async fn dispatch(state: &AppState, transport_id: &str, message: ClientMessage, out: &mpsc::UnboundedSender<ServerEvent>) {
    match message {
        ClientMessage::CheckConnection { session_id } => {
            let exists = session_id
                .as_deref()
                .map(|id| state.registry.get(id).is_some())
                .unwrap_or(false);
            if !exists {
                let _ = out.send(ServerEvent::Error { message: "no active connection".to_string() });
            }
        }
        ClientMessage::Connect {
            host,
            port,
            username,
            private_key,
            passphrase,
        } => {
            let _ = state
                .orchestrator
                .connect(
                    transport_id,
                    ConnectRequest {
                        host,
                        port,
                        username,
                        private_key,
                        passphrase,
                    },
                    out.clone(),
                    state.queue.clone(),
                )
                .await;
        }
        ClientMessage::ExecuteCommand {
            command,
            background,
            execution_id,
            stream,
        } => {
            if let Some(session) = state.registry.lookup(transport_id) {
                state
                    .executor
                    .execute_command(&session, &command, background, execution_id, stream, out)
                    .await;
            } else {
                let _ = out.send(ServerEvent::CommandError {
                    command,
                    error: "no active session".to_string(),
                    needs_elevation: false,
                });
            }
        }
        ClientMessage::ExecuteBatch {
            commands,
            batch_id,
            background,
        } => {
            if let Some(session) = state.registry.lookup(transport_id) {
                state.executor.execute_batch(&session, commands, batch_id, background, out).await;
            } else {
                let _ = out.send(ServerEvent::CommandBatchResult {
                    batch_id,
                    results: vec![],
                    error: Some("no active session".to_string()),
                    background,
                });
            }
        }
        ClientMessage::RestartShell => {
            if let Some(session) = state.registry.lookup(transport_id) {
                let streamer = crate::shell::ShellStreamer::new(session.clone(), state.queue.clone(), out.clone());
                if let Err(e) = streamer.open().await {
                    let _ = out.send(ServerEvent::Error { message: e });
                }
            }
        }
        ClientMessage::Resize { cols, rows } => {
            if let Some(session) = state.registry.lookup(transport_id) {
                session.resize(cols, rows).await;
            }
        }
        ClientMessage::Input { data } => {
            if let Some(session) = state.registry.lookup(transport_id) {
                session.touch();
                session.send_input(decode_bytes(&data)).await;
            }
        }
        ClientMessage::RefreshConnection => {
            if let Some(session) = state.registry.lookup(transport_id) {
                session.touch();
            }
        }
        ClientMessage::Disconnect => {
            if let Some(session) = state.registry.lookup(transport_id) {
                state.orchestrator.teardown(&session.session_id).await;
                state.queue.clear_session(&session.session_id).await;
                let _ = out.send(ServerEvent::Ended { message: "session disconnected".to_string() });
            }
        }
    }
}

#[derive(serde::Serialize)]
pub struct HealthResponse {
    status: &'static str,
    sessions: usize,
    queue_running: usize,
    queue_pending: usize,
}

#[handler]
pub fn health_handler(Data(state): Data<&AppState>) -> poem::web::Json<HealthResponse> {
    let (running, pending) = state.queue.state();
    poem::web::Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
        queue_running: running,
        queue_pending: pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let data = b"hello world";
        let encoded = encode_bytes(data);
        assert_eq!(decode_bytes(&encoded), data);
    }

    #[test]
    fn test_decode_invalid_base64_returns_empty() {
        assert_eq!(decode_bytes("not base64!!"), Vec::<u8>::new());
    }
}
