//! Axum router and WebSocket upgrade with `authKey` gating.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::signaling;

/// WebSocket close code sent when the auth key does not match.
const CLOSE_AUTH_FAILED: u16 = 1002;

pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len().await,
    }))
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "authKey")]
    auth_key: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let authorized = check_auth(&state.config.auth_key, query.auth_key.as_deref());
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            tracing::warn!("Rejecting connection: auth key mismatch");
            reject(socket).await;
            return;
        }
        signaling::handle_connection(socket, state).await;
    })
}

/// An empty server key accepts every client, including ones that sent no
/// key at all.
fn check_auth(server_key: &str, client_key: Option<&str>) -> bool {
    server_key.is_empty() || client_key == Some(server_key)
}

async fn reject(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_AUTH_FAILED,
            reason: "authentication failed".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_key_accepts_anything() {
        assert!(check_auth("", None));
        assert!(check_auth("", Some("whatever")));
        assert!(check_auth("", Some("")));
    }

    #[test]
    fn matching_key_is_accepted() {
        assert!(check_auth("secret", Some("secret")));
    }

    #[test]
    fn wrong_or_missing_key_is_rejected() {
        assert!(!check_auth("secret", Some("wrong")));
        assert!(!check_auth("secret", Some("")));
        assert!(!check_auth("secret", None));
    }

    #[test]
    fn auth_close_code_is_1002() {
        assert_eq!(CLOSE_AUTH_FAILED, 1002);
    }
}
