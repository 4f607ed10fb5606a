//! Per-connection signaling loop: JSON text messages in, answers, trickle
//! ICE and stats out. Binary media never flows here; it uses the data
//! channel once negotiation completes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use castpipe_protocol::SignalMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::ClientSession;
use crate::web::AppState;

pub async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>) {
    let id = Uuid::new_v4();
    let (signal_tx, mut signal_rx) = mpsc::channel::<SignalMessage>(64);
    let session = ClientSession::spawn(id, Arc::clone(&state.config), signal_tx);
    state.registry.insert(Arc::clone(&session)).await;
    tracing::info!(client_id = %id, "Signaling connected");

    loop {
        tokio::select! {
            // Peer transport died or the session was closed elsewhere
            _ = session.cancelled() => {
                tracing::info!(client_id = %id, "Session cancelled, closing signaling");
                break;
            }
            // Outbound: answer, trickle ICE, stats
            outbound = signal_rx.recv() => {
                let Some(msg) = outbound else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(client_id = %id, "Failed to serialize signaling message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(client_id = %id, "Signaling send failed");
                    break;
                }
            }
            // Inbound: offer and ICE candidates
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(msg) => session.handle_signal(msg).await,
                            Err(e) => {
                                tracing::warn!(client_id = %id, "Invalid signaling message, dropping: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!(client_id = %id, "Binary frame on signaling channel, dropping");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(client_id = %id, "Signaling closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %id, "Signaling error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong
                }
            }
        }
    }

    state.registry.remove_and_close(id).await;
    tracing::info!(client_id = %id, "Signaling disconnected");
}
