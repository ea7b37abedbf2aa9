use crate::AppState;
use crate::sync::{ConnectionError, MessageSink};
use async_trait::async_trait;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use docsync_core::protocol::{self, AuthMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Document name
    pub doc: String,
    /// Auth token
    pub token: Option<String>,
}

/// Outbound half of an axum WebSocket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.0
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn pong(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.0
            .send(Message::Pong(payload.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.0
            .close()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Authentication happens after the upgrade so the client can be told why.
    if let Err(reason) = state
        .authenticator
        .authenticate(&query.doc, query.token.as_deref())
    {
        warn!(document = %query.doc, "WebSocket connection rejected: {}", reason);
        let denied = protocol::Message::Auth(AuthMessage::PermissionDenied { reason }).encode();
        let _ = ws_tx.send(Message::Binary(denied.into())).await;
        let _ = ws_tx.close().await;
        return;
    }

    let connection = state.registry.connect(
        &query.doc,
        state.manager.clone(),
        Box::new(WsSink(ws_tx)),
    );

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if let Err(e) = connection.handle_frame(&data).await {
                    if e.is_protocol_violation() {
                        warn!(
                            document = %query.doc,
                            connection = connection.id(),
                            "Protocol violation, closing: {}",
                            e
                        );
                    } else {
                        warn!(
                            document = %query.doc,
                            connection = connection.id(),
                            "Failed to handle message, closing: {}",
                            e
                        );
                    }
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                if let Err(e) = connection.pong(data.to_vec()) {
                    debug!("Failed to send pong: {}", e);
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!(connection = connection.id(), "Client requested close");
                break;
            }
            Err(e) => {
                debug!(connection = connection.id(), "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    state.registry.disconnect(&connection).await;
    connection.close().await;
    info!(document = %query.doc, connection = connection.id(), "WebSocket closed");
}
