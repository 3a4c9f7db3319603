//! Per-socket protocol state machine.
//!
//! Each connection splits the websocket into a spawned send loop (owning the
//! sink: welcome frame, both keepalives, the outbound queue, and the final
//! disconnect/close frames) and an inline receive loop (owning the command
//! dispatch and the recorded unsubscribers). Both halves share one
//! cancellation token; whichever side stops first cancels the other.
//!
//! Keepalive is dual: an application-level `ping` frame every 3 s so clients
//! detect stalls quickly, and a websocket ping every 54 s paired with a 60 s
//! read deadline so the server detects a silent peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::channel::{ChannelDispatcher, Unsubscriber};
use super::messages::{ClientMessage, DisconnectMessage, ServerMessage};
use super::subscription::Subscription;

/// Subprotocol negotiated with Action Cable clients.
pub const SUBPROTOCOL: &str = "actioncable-v1-json";

/// How long a silent peer is tolerated before the connection is torn down.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Websocket ping interval; must fire well within [`PONG_WAIT`].
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Application-level ping interval.
const CABLE_PING_PERIOD: Duration = Duration::from_secs(3);
/// Deadline for any single outbound frame.
const WRITE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("couldn't parse client frame as JSON")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("read deadline exceeded")]
    ReadTimeout,
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error("websocket transport failed")]
    Transport(#[source] axum::Error),
    #[error("connection cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Cancellation is part of normal shutdown (logout, server stop) and is
    /// not reported as a failure.
    fn is_normal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One client connection over an upgraded websocket.
pub struct Connection {
    dispatcher: ChannelDispatcher,
    to_client: mpsc::Sender<ServerMessage>,
    outbound: mpsc::Receiver<ServerMessage>,
}

impl Connection {
    /// `queue_capacity` bounds the outbound frame queue; subscriptions drop
    /// frames rather than block when it fills.
    pub fn new(dispatcher: ChannelDispatcher, queue_capacity: usize) -> Self {
        let (to_client, outbound) = mpsc::channel(queue_capacity);
        Self {
            dispatcher,
            to_client,
            outbound,
        }
    }

    /// Drive the connection until the client leaves, the peer goes silent,
    /// a protocol violation occurs, or `cancel` fires.
    ///
    /// The socket is any frame stream/sink pair; `axum`'s upgraded
    /// `WebSocket` satisfies the bound directly.
    ///
    /// Every recorded subscription is unsubscribed before the socket is
    /// released. Normal closes (clean client close, cancellation) return
    /// `Ok`; the caller only sees errors worth logging.
    pub async fn serve<S>(
        self,
        socket: S,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<WsMessage, axum::Error>>
            + Sink<WsMessage, Error = axum::Error>
            + Send
            + 'static,
    {
        let Connection {
            dispatcher,
            to_client,
            outbound,
        } = self;
        let (sink, mut stream) = socket.split();

        let reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sender = tokio::spawn(send_all(sink, outbound, cancel.clone(), Arc::clone(&reason)));

        let mut state = ReceiveState {
            dispatcher,
            to_client,
            unsubscribers: HashMap::new(),
            cancel: cancel.clone(),
        };
        let received = receive_all(&mut state, &mut stream).await;

        // Remove every hub receiver before the socket goes away, so no
        // broadcast can race a dead connection.
        for (_, unsubscriber) in state.unsubscribers.drain() {
            unsubscriber().await;
        }

        *reason
            .lock()
            .expect("close reason lock should not be poisoned") = Some(close_reason(&received));
        cancel.cancel();
        let sent = sender.await.unwrap_or(Ok(()));

        match received {
            Err(err) if !err.is_normal() => Err(err),
            _ => match sent {
                Err(err) if !err.is_normal() => Err(err),
                _ => Ok(()),
            },
        }
    }
}

/// Disconnect reason shown to the client. Sanitized: internal error detail
/// never crosses the wire, and a clean peer close carries no reason at all.
fn close_reason(received: &Result<(), ConnectionError>) -> String {
    match received {
        Ok(()) => String::new(),
        Err(ConnectionError::Cancelled) => "logged out".to_owned(),
        Err(_) => "server or client error".to_owned(),
    }
}

struct ReceiveState {
    dispatcher: ChannelDispatcher,
    to_client: mpsc::Sender<ServerMessage>,
    unsubscribers: HashMap<String, Unsubscriber>,
    cancel: CancellationToken,
}

impl ReceiveState {
    async fn receive(&mut self, command: ClientMessage) -> Result<(), ConnectionError> {
        match command.command.as_str() {
            ClientMessage::SUBSCRIBE => self.subscribe(command.identifier).await,
            ClientMessage::UNSUBSCRIBE => {
                if let Some(unsubscriber) = self.unsubscribers.remove(&command.identifier) {
                    unsubscriber().await;
                }
                Ok(())
            }
            ClientMessage::MESSAGE => {
                if let Err(err) = self
                    .dispatcher
                    .perform(&command.identifier, &command.data)
                    .await
                {
                    // The message is dropped; the connection and the
                    // subscription stay up.
                    debug!(identifier = %command.identifier, error = %err, "dropped unprocessable message");
                }
                Ok(())
            }
            unknown => Err(ConnectionError::UnknownCommand(unknown.to_owned())),
        }
    }

    async fn subscribe(&mut self, identifier: String) -> Result<(), ConnectionError> {
        if self.unsubscribers.contains_key(&identifier) {
            // Already confirmed; repeat the confirmation instead of
            // double-subscribing.
            self.send(ServerMessage::confirm_subscription(identifier))
                .await;
            return Ok(());
        }

        let subscription = Subscription::new(identifier.clone(), self.to_client.clone());
        match self
            .dispatcher
            .subscribe(self.cancel.child_token(), subscription)
            .await
        {
            Ok(Some(unsubscriber)) => {
                self.unsubscribers.insert(identifier.clone(), unsubscriber);
                self.send(ServerMessage::confirm_subscription(identifier))
                    .await;
            }
            Ok(None) => {
                self.send(ServerMessage::reject_subscription(identifier))
                    .await;
            }
            Err(err) => {
                // Rejected identically to a declined subscription; the error
                // detail stays server-side.
                debug!(identifier = %identifier, error = %err, "subscription failed");
                self.send(ServerMessage::reject_subscription(identifier))
                    .await;
            }
        }
        Ok(())
    }

    async fn send(&self, frame: ServerMessage) {
        let _ = self.to_client.send(frame).await;
    }
}

async fn receive_all<R>(
    state: &mut ReceiveState,
    stream: &mut R,
) -> Result<(), ConnectionError>
where
    R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = state.cancel.cancelled() => return Err(ConnectionError::Cancelled),
            next = timeout(PONG_WAIT, stream.next()) => next,
        };
        let frame = match next {
            Err(_elapsed) => return Err(ConnectionError::ReadTimeout),
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => return Err(ConnectionError::Transport(err)),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMessage::Text(text) => {
                let command = serde_json::from_str(&text).map_err(ConnectionError::Malformed)?;
                state.receive(command).await?;
            }
            // Any inbound frame, pongs included, refreshes the read deadline.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Binary(_) => debug!("ignoring binary frame"),
            WsMessage::Close(_) => return Ok(()),
        }
    }
}

async fn send_all<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
) -> Result<(), ConnectionError>
where
    K: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    let mut result = send_json(&mut sink, &ServerMessage::welcome()).await;
    if result.is_ok() {
        let start = Instant::now();
        let mut ws_ping = interval_at(start + PING_PERIOD, PING_PERIOD);
        let mut cable_ping = interval_at(start + CABLE_PING_PERIOD, CABLE_PING_PERIOD);
        result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ws_ping.tick() => {
                    if let Err(err) = send_frame(&mut sink, WsMessage::Ping(Vec::new())).await {
                        break Err(err);
                    }
                }
                _ = cable_ping.tick() => {
                    if let Err(err) = send_json(&mut sink, &ServerMessage::ping(Utc::now())).await {
                        break Err(err);
                    }
                }
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = send_json(&mut sink, &frame).await {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                }
            }
        };
    }
    if result.is_err() {
        // The transport is gone; unblock the receive loop.
        cancel.cancel();
    }

    // Courtesy frames; the peer may already be gone, so failures are ignored.
    let reason = reason
        .lock()
        .expect("close reason lock should not be poisoned")
        .take()
        .unwrap_or_else(|| close_reason(&Err(ConnectionError::Cancelled)));
    let _ = send_json(&mut sink, &DisconnectMessage::new(reason, false)).await;
    let _ = timeout(WRITE_WAIT, sink.send(WsMessage::Close(None))).await;
    result
}

async fn send_json<K, T>(sink: &mut K, frame: &T) -> Result<(), ConnectionError>
where
    K: Sink<WsMessage, Error = axum::Error> + Unpin,
    T: Serialize,
{
    let text =
        serde_json::to_string(frame).expect("wire frame serialization should not fail");
    send_frame(sink, WsMessage::Text(text)).await
}

async fn send_frame<K>(sink: &mut K, frame: WsMessage) -> Result<(), ConnectionError>
where
    K: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    match timeout(WRITE_WAIT, sink.send(frame)).await {
        Err(_elapsed) => Err(ConnectionError::WriteTimeout),
        Ok(Err(err)) => Err(ConnectionError::Transport(err)),
        Ok(Ok(())) => Ok(()),
    }
}
