//! WebSocket event stream.
//!
//! Every connected client receives the broadcast envelope stream
//! (`{type, data, timestamp}`). Clients are read-mostly; inbound text is
//! ignored except for close frames.

use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use oculink_core::Broadcaster;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tracks live event-stream connections.
pub struct ConnectionManager {
    connections: DashMap<Uuid, ()>,
    broadcaster: Broadcaster,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self {
            connections: DashMap::new(),
            broadcaster,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    async fn run(self: Arc<Self>, socket: WebSocket) {
        let conn_id = Uuid::new_v4();
        self.connections.insert(conn_id, ());
        debug!(%conn_id, connections = self.connections.len(), "event stream client connected");

        let (mut sink, mut stream) = socket.split();
        let mut events = self.broadcaster.subscribe();

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            let envelope = event.envelope();
                            let Ok(text) = serde_json::to_string(&envelope) else {
                                continue;
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(%conn_id, missed, "event stream client lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }

        self.connections.remove(&conn_id);
        debug!(%conn_id, "event stream client disconnected");
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let manager = state.websocket_manager.clone();
    ws.on_upgrade(move |socket| manager.run(socket))
}
