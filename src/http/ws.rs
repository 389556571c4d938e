//! Streaming session protocol over WebSocket
//!
//! One connection drives one session at a time. Inbound messages are handled
//! in order; everything sent to the client goes through a single writer task.

use super::admission::ConnectionPermit;
use super::messages::{ClientMessage, ServerMessage};
use super::state::AppState;
use crate::correlator::ResultSubscription;
use crate::dispatch::{ChunkResult, ChunkTask, DispatchError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outbound messages buffered per connection
const OUTBOUND_BUFFER: usize = 64;

/// GET /ws/asr
pub async fn asr_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(permit): Extension<ConnectionPermit>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state).await;
        drop(permit);
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!("Client went away, dropping outbound messages");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        state,
        out: out_tx,
        session_id: None,
        subscription: None,
    };

    info!(
        "WebSocket connected ({} open)",
        conn.state.connections.active()
    );

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => conn.handle_text(&text).await,
            Ok(Message::Binary(_)) => {
                conn.send(ServerMessage::error("binary frames are not supported"))
                    .await
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the transport
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket read failed: {}", e);
                break;
            }
        }
    }

    conn.close();
    drop(conn);

    if let Err(e) = writer.await {
        error!("WebSocket writer panicked: {}", e);
    }
    info!("WebSocket disconnected");
}

struct Connection {
    state: AppState,
    out: mpsc::Sender<ServerMessage>,
    /// Session most recently started on this connection
    session_id: Option<String>,
    subscription: Option<ResultSubscription>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        if self.out.send(msg).await.is_err() {
            debug!("Outbound channel closed");
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid client message: {}", e);
                self.send(ServerMessage::error(format!("invalid message: {}", e)))
                    .await;
                return;
            }
        };

        match msg {
            ClientMessage::Start {
                session_id,
                user_id,
            } => self.start(session_id, &user_id).await,
            ClientMessage::Chunk {
                session_id,
                chunk_index,
                audio_data,
            } => {
                let id = self.resolve(session_id);
                self.chunk(id, chunk_index, &audio_data).await
            }
            ClientMessage::Finish { session_id } => {
                let id = self.resolve(session_id);
                self.finish(id).await
            }
        }
    }

    /// Messages without a session id refer to the connection's session
    fn resolve(&self, session_id: String) -> String {
        if session_id.is_empty() {
            self.session_id.clone().unwrap_or_default()
        } else {
            session_id
        }
    }

    async fn start(&mut self, session_id: String, user_id: &str) {
        let session_id = if session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            session_id
        };

        // A live result flow is a precondition of a queue-backed session
        if self.state.dispatcher.uses_result_feed() {
            let Some(correlator) = self.state.correlator.clone() else {
                error!("Queue backend configured without a result correlator");
                self.send(ServerMessage::error("result delivery unavailable"))
                    .await;
                return;
            };

            let (mut results, subscription) = match correlator.subscribe(&session_id).await {
                Ok(subscribed) => subscribed,
                Err(e) => {
                    error!("Failed to subscribe session {}: {:#}", session_id, e);
                    self.send(ServerMessage::error("failed to subscribe to results"))
                        .await;
                    return;
                }
            };

            if let Some(previous) = self.subscription.replace(subscription) {
                previous.cancel();
            }

            let sessions = self.state.sessions.clone();
            let out = self.out.clone();
            let id = session_id.clone();
            tokio::spawn(async move {
                while let Some(result) = results.recv().await {
                    // Backlog entries for chunks this session never accepted
                    if !sessions.apply_result(&id, &result).await {
                        debug!(
                            "Dropping result for chunk {} of session {}",
                            result.chunk_index, id
                        );
                        continue;
                    }
                    if out
                        .send(ServerMessage::chunk_result(&id, &result))
                        .await
                        .is_err()
                    {
                        debug!("Client went away, stopping results of session {}", id);
                        break;
                    }
                }
            });
        }

        let session = self
            .state
            .sessions
            .create_session(&session_id, user_id)
            .await;
        self.session_id = Some(session.id.clone());
        self.send(ServerMessage::session_started(&session.id)).await;
    }

    async fn chunk(&self, session_id: String, chunk_index: u32, audio_data: &str) {
        let sessions = &self.state.sessions;
        if !sessions.contains(&session_id) {
            self.send(ServerMessage::error(format!(
                "session not found: {}",
                session_id
            )))
            .await;
            return;
        }

        let audio = match base64::engine::general_purpose::STANDARD.decode(audio_data) {
            Ok(audio) => audio,
            Err(e) => {
                self.send(ServerMessage::error(format!("invalid audio data: {}", e)))
                    .await;
                return;
            }
        };

        if !sessions.add_chunk(&session_id, chunk_index, &audio).await {
            self.send(ServerMessage::error(format!(
                "session not found: {}",
                session_id
            )))
            .await;
            return;
        }

        let task = ChunkTask::new(session_id.clone(), chunk_index, audio);
        let submitted = if self.state.dispatcher.uses_result_feed() {
            self.state.dispatcher.submit(task).await
        } else {
            let (task, response) = task.with_response();
            let submitted = self.state.dispatcher.submit(task).await;
            if submitted.is_ok() {
                let sessions = sessions.clone();
                let out = self.out.clone();
                let id = session_id.clone();
                tokio::spawn(async move {
                    let result = response.await.unwrap_or_else(|_| {
                        ChunkResult::failed(chunk_index, "worker dropped the chunk")
                    });
                    if !sessions.apply_result(&id, &result).await {
                        return;
                    }
                    if out
                        .send(ServerMessage::chunk_result(&id, &result))
                        .await
                        .is_err()
                    {
                        debug!(
                            "Client went away before chunk {} of session {} resolved",
                            chunk_index, id
                        );
                    }
                });
            }
            submitted
        };

        match submitted {
            Ok(()) => {
                self.send(ServerMessage::chunk_received(&session_id, chunk_index))
                    .await
            }
            Err(e) => {
                // Resolve the chunk so finishing does not wait for it
                sessions
                    .set_result(&session_id, chunk_index, "", Some(&e.to_string()))
                    .await;

                let message = match &e {
                    DispatchError::Overloaded { .. } => {
                        "system busy, please retry later".to_string()
                    }
                    other => {
                        error!(
                            "Failed to dispatch chunk {} of session {}: {}",
                            chunk_index, session_id, other
                        );
                        format!("failed to dispatch chunk: {}", other)
                    }
                };
                self.send(ServerMessage::error(message)).await;
            }
        }
    }

    async fn finish(&mut self, session_id: String) {
        if !self.state.sessions.contains(&session_id) {
            self.send(ServerMessage::error(format!(
                "session not found: {}",
                session_id
            )))
            .await;
            return;
        }

        let transcript = self.state.sessions.wait_and_merge(&session_id).await;
        self.send(ServerMessage::final_result(&session_id, &transcript))
            .await;

        if self.session_id.as_deref() == Some(session_id.as_str()) {
            if let Some(subscription) = self.subscription.take() {
                subscription.cancel();
            }
        }
    }

    fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}
