//! HTTP endpoint upgrading clients onto the cable.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::TransportConfig;

use super::cancellers::Cancellers;
use super::channel::{ChannelDispatcher, ChannelFactory};
use super::connection::{Connection, SUBPROTOCOL};

/// Resolves the session id of an upgrade request, typically from a session
/// cookie. Requests without a session are refused before the upgrade.
pub trait SessionResolver: Send + Sync {
    fn session_id(&self, headers: &HeaderMap) -> Option<String>;
}

/// Builds the channel factory registry for one session's connection.
pub type SessionFactories =
    Arc<dyn Fn(&str) -> HashMap<String, ChannelFactory> + Send + Sync>;

/// Shared state for the cable endpoint.
#[derive(Clone)]
pub struct CableState {
    resolver: Arc<dyn SessionResolver>,
    factories: SessionFactories,
    cancellers: Arc<Cancellers>,
    queue_capacity: usize,
    max_message_bytes: usize,
}

impl CableState {
    pub fn new(
        resolver: Arc<dyn SessionResolver>,
        factories: SessionFactories,
        cancellers: Arc<Cancellers>,
        transport: &TransportConfig,
    ) -> Self {
        Self {
            resolver,
            factories,
            cancellers,
            queue_capacity: transport.queue_capacity,
            max_message_bytes: transport.max_message_bytes,
        }
    }
}

/// Router exposing the upgrade endpoint at `/cable`.
pub fn routes() -> axum::Router<CableState> {
    axum::Router::new().route("/cable", get(upgrade))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<CableState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = state.resolver.session_id(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.protocols([SUBPROTOCOL])
        .max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| serve_connection(socket, session_id, state))
}

async fn serve_connection(socket: WebSocket, session_id: String, state: CableState) {
    let cancel = CancellationToken::new();
    state.cancellers.add(&session_id, cancel.clone());

    let factories = (state.factories)(&session_id);
    let connection = Connection::new(ChannelDispatcher::new(factories), state.queue_capacity);
    // Past the upgrade there is nobody to return an error to; log and move on.
    match connection.serve(socket, cancel).await {
        Ok(()) => debug!(session_id = %session_id, "connection closed"),
        Err(err) => error!(session_id = %session_id, error = %err, "connection failed"),
    }
}
