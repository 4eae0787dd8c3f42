use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::state::AppState;
use crate::error::ProcessorError;
use crate::session::ContainerHint;

const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Connections that miss ping replies for this long are closed
const PONG_GRACE: Duration = Duration::from_secs(30);
const OUTBOUND_BUFFER: usize = 64;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one client connection for its whole lifetime
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    info!("Client {} connected", connection_id);
    let (mut sink, mut stream) = socket.split();

    // A single writer task owns the sink; replies, broadcast forwarders
    // and the ping timer all funnel through this channel.
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let ping_tx = tx.clone();
    let ping_seen = last_pong.clone();
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if ping_seen.lock().await.elapsed() > PONG_GRACE {
                debug!("Client stopped answering pings, closing");
                let _ = ping_tx.send(Message::Close(None)).await;
                break;
            }
            if ping_tx
                .send(Message::Text(ServerMessage::Ping.to_json()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut connection = Connection {
        state,
        tx: tx.clone(),
        joined: HashMap::new(),
        last_pong,
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => connection.handle(msg).await,
                Err(e) => {
                    debug!("Malformed message from client {}: {}", connection_id, e);
                    connection
                        .send(ServerMessage::Error {
                            message: format!("Malformed message: {}", e),
                        })
                        .await;
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    for (_, forwarder) in connection.joined.drain() {
        forwarder.abort();
    }
    ping_task.abort();
    drop(connection);
    drop(tx);
    let _ = writer.await;
    info!("Client {} disconnected", connection_id);
}

/// Per-connection state: the outbound channel and the sessions this
/// connection subscribed to.
struct Connection {
    state: AppState,
    tx: mpsc::Sender<Message>,
    joined: HashMap<String, JoinHandle<()>>,
    last_pong: Arc<Mutex<Instant>>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(Message::Text(msg.to_json())).await;
    }

    async fn send_error(&self, e: ProcessorError) {
        self.send(ServerMessage::Error {
            message: e.to_string(),
        })
        .await;
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::StartRecording {
                session_id,
                user_id,
                title,
                ..
            } => {
                match self
                    .state
                    .processor
                    .initialize_session(&session_id, &user_id, title.as_deref())
                    .await
                {
                    Ok(()) => {
                        // The recording client gets its own live updates
                        self.subscribe(&session_id);
                        self.send(ServerMessage::RecordingStarted { session_id }).await;
                    }
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::AudioChunk {
                session_id,
                audio_data,
                mime_type,
                audio_level,
                chunk_id,
            } => {
                let payload = match base64::engine::general_purpose::STANDARD.decode(&audio_data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.send(ServerMessage::Error {
                            message: format!("Invalid base64 audio data: {}", e),
                        })
                        .await;
                        return;
                    }
                };
                let hint = ContainerHint::from_mime_type(&mime_type);
                match self
                    .state
                    .processor
                    .add_fragment(&session_id, payload, hint, audio_level, chunk_id.clone())
                    .await
                {
                    Ok(()) => {
                        self.send(ServerMessage::ChunkReceived {
                            session_id,
                            chunk_id,
                        })
                        .await
                    }
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::PauseRecording { session_id } => {
                match self.state.processor.pause(&session_id).await {
                    Ok(()) => self.send(ServerMessage::RecordingPaused { session_id }).await,
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::ResumeRecording { session_id, .. } => {
                match self.state.processor.resume(&session_id).await {
                    Ok(()) => self.send(ServerMessage::RecordingResumed { session_id }).await,
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::StopRecording { session_id } => {
                match self.state.processor.stop(&session_id).await {
                    Ok((transcript, summary)) => {
                        self.send(ServerMessage::RecordingCompleted {
                            session_id,
                            transcript,
                            summary,
                        })
                        .await
                    }
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::CancelRecording { session_id } => {
                match self.state.processor.cancel(&session_id).await {
                    Ok(()) => {
                        self.send(ServerMessage::RecordingCancelled { session_id }).await
                    }
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::JoinSession { session_id } => {
                self.subscribe(&session_id);
                // Status snapshot so late joiners know where the session is
                match self.state.processor.db().get_session(&session_id) {
                    Ok(Some(row)) => {
                        self.send(ServerMessage::StatusUpdate {
                            session_id,
                            status: row.status,
                        })
                        .await
                    }
                    Ok(None) => {
                        self.send_error(ProcessorError::NotFound(session_id)).await
                    }
                    Err(e) => self.send_error(e).await,
                }
            }

            ClientMessage::Pong => {
                *self.last_pong.lock().await = Instant::now();
            }
        }
    }

    /// Forward a session's broadcast events into this connection
    fn subscribe(&mut self, session_id: &str) {
        if self.joined.contains_key(session_id) {
            return;
        }

        let mut rx = self.state.processor.fanout().subscribe(session_id);
        let tx = self.tx.clone();
        let id = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let msg = ServerMessage::from_event(event);
                        if tx.send(Message::Text(msg.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscriber lagged {} events for session {}", n, id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.joined.insert(session_id.to_string(), forwarder);
    }
}
