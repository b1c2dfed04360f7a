//! WebSocket Client Server
//!
//! Serves `/ws/{client_id}` (optional `?user_id=`). Each socket becomes one
//! hub connection: client frames drive subscribe / unsubscribe, and the
//! connection's outbound queue is drained onto the socket until either side
//! goes away.

pub mod message;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use message::{ClientMessage, ServerMessage};

use crate::application::services::hub::{
    ClientConnection, SharedSubscriptionHub, SubscriptionHub,
};
use crate::domain::feed::FeedType;
use crate::domain::subscription::ConnectionId;

// =============================================================================
// Server
// =============================================================================

#[derive(Clone)]
struct WsState {
    hub: SharedSubscriptionHub,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
}

/// WebSocket server for browser clients.
pub struct WsServer {
    port: u16,
    hub: SharedSubscriptionHub,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a new WebSocket server.
    #[must_use]
    pub const fn new(port: u16, hub: SharedSubscriptionHub, cancel: CancellationToken) -> Self {
        Self { port, hub, cancel }
    }

    /// Run until cancelled. Open sockets are closed on cancellation.
    ///
    /// # Errors
    ///
    /// Returns `WsServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), WsServerError> {
        let app = router(self.hub, self.cancel.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WsServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "WebSocket server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| WsServerError::ServerFailed(e.to_string()))?;

        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

/// WebSocket routes over `hub`. Sockets close when `cancel` fires.
pub fn router(hub: SharedSubscriptionHub, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/ws/{client_id}", get(ws_handler))
        .with_state(WsState { hub, cancel })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state, client_id, params.user_id))
}

// =============================================================================
// Socket Loop
// =============================================================================

async fn serve_socket(
    mut socket: WebSocket,
    state: WsState,
    client_id: String,
    user_id: Option<String>,
) {
    let ClientConnection { id, mut outbound } = state.hub.connect(user_id);

    let welcome = ServerMessage::ConnectionEstablished {
        client_id,
        connection_id: id.to_string(),
        available_subscriptions: FeedType::all().to_vec(),
        timestamp: Utc::now(),
    };

    if send(&mut socket, &welcome).await {
        loop {
            tokio::select! {
                biased;

                () = state.cancel.cancelled() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }

                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = respond(&state.hub, id, text.as_str());
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, error = %e, "WebSocket receive failed");
                        break;
                    }
                },

                update = outbound.recv() => match update {
                    Some(update) => {
                        if !send(&mut socket, &ServerMessage::from_update(&update)).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    state.hub.disconnect(id);
}

/// Write one frame. Returns false when the socket is gone.
async fn send(socket: &mut WebSocket, message: &ServerMessage<'_>) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode frame");
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

/// Handle one client text frame and build the reply.
pub fn respond(hub: &SubscriptionHub, id: ConnectionId, text: &str) -> ServerMessage<'static> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => return ServerMessage::error(format!("invalid message: {e}")),
    };

    let result = match message {
        ClientMessage::Subscribe {
            subscription_type,
            coins,
        } => subscription_type
            .parse::<FeedType>()
            .map_err(|e| e.to_string())
            .and_then(|feed_type| {
                hub.subscribe(id, feed_type, &coins)
                    .map_err(|e| e.to_string())?;
                Ok(ServerMessage::SubscriptionConfirmed {
                    subscription_type: feed_type,
                    watched_coins: watched_coins(hub, id, feed_type),
                    timestamp: Utc::now(),
                })
            }),
        ClientMessage::Unsubscribe {
            subscription_type,
            coins,
        } => subscription_type
            .parse::<FeedType>()
            .map_err(|e| e.to_string())
            .and_then(|feed_type| {
                let removed = hub
                    .unsubscribe(id, feed_type, coins.as_deref())
                    .map_err(|e| e.to_string())?;
                Ok(ServerMessage::UnsubscriptionConfirmed {
                    subscription_type: feed_type,
                    removed: removed
                        .iter()
                        .filter(|key| !key.instrument.is_wildcard())
                        .map(|key| key.instrument.to_string())
                        .collect(),
                    timestamp: Utc::now(),
                })
            }),
        ClientMessage::Ping => Ok(ServerMessage::Pong {
            timestamp: Utc::now(),
        }),
        ClientMessage::GetCurrentPrices { coins } => hub
            .current_prices(&coins)
            .map(|prices| ServerMessage::CurrentPrices {
                data: prices
                    .into_iter()
                    .map(|(coin, price)| (coin.to_string(), price))
                    .collect::<BTreeMap<_, _>>(),
                timestamp: Utc::now(),
            })
            .map_err(|e| e.to_string()),
    };

    result.unwrap_or_else(|message| {
        tracing::debug!(connection = %id, reason = %message, "Rejected client request");
        ServerMessage::error(message)
    })
}

fn watched_coins(
    hub: &SubscriptionHub,
    id: ConnectionId,
    feed_type: FeedType,
) -> Option<Vec<String>> {
    feed_type.is_instrument_scoped().then(|| {
        hub.subscriptions_of(id)
            .into_iter()
            .filter(|key| key.feed_type == feed_type)
            .map(|key| key.instrument.to_string())
            .collect()
    })
}

// =============================================================================
// Errors
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum WsServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
