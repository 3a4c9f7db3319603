//! Handle for writing to one confirmed subscription.

use tokio::sync::mpsc;
use tracing::debug;

use super::messages::ServerMessage;

/// Write side of a confirmed subscription: an identifier plus a non-blocking
/// path into the connection's outbound queue.
///
/// Deliveries never block. If the queue is full the frame is dropped and the
/// caller is told, so a slow consumer loses messages instead of stalling the
/// broadcast that produced them.
#[derive(Clone)]
pub struct Subscription {
    identifier: String,
    to_client: mpsc::Sender<ServerMessage>,
}

impl Subscription {
    pub fn new(identifier: String, to_client: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            identifier,
            to_client,
        }
    }

    /// Opaque identifier string the client subscribed with.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queue a data frame for the client. Returns `false` if the frame was
    /// dropped (queue full or connection gone).
    pub fn receive(&self, message: impl Into<String>) -> bool {
        let frame = ServerMessage::data(self.identifier.clone(), message);
        match self.to_client.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(identifier = %self.identifier, error = %err, "dropped subscription frame");
                false
            }
        }
    }

    /// Tell the client the subscription ended by pushing a rejection frame.
    /// Best-effort; a full queue means the connection is on its way out.
    pub fn close(&self) {
        let _ = self
            .to_client
            .try_send(ServerMessage::reject_subscription(self.identifier.clone()));
    }
}
