//! Session-wide connection cancellation.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of connection cancellation tokens grouped by session id.
///
/// One session may hold several concurrent connections (multiple tabs);
/// cancelling the session cancels all of them, e.g. on logout, without
/// touching any other session's connections.
#[derive(Default)]
pub struct Cancellers {
    by_session: Mutex<HashMap<String, Vec<CancellationToken>>>,
}

impl Cancellers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection's token under its session. Tokens of connections
    /// that already ended are dropped here, so long-lived sessions don't
    /// accumulate them.
    pub fn add(&self, session_id: &str, cancel: CancellationToken) {
        let mut by_session = self
            .by_session
            .lock()
            .expect("cancellers lock should not be poisoned");
        let tokens = by_session.entry(session_id.to_owned()).or_default();
        tokens.retain(|token| !token.is_cancelled());
        tokens.push(cancel);
    }

    /// Cancel every connection recorded for a session and forget them.
    /// Unknown sessions are a no-op.
    pub fn cancel(&self, session_id: &str) {
        let tokens = self
            .by_session
            .lock()
            .expect("cancellers lock should not be poisoned")
            .remove(session_id);
        if let Some(tokens) = tokens {
            debug!(session_id, connections = tokens.len(), "cancelling session connections");
            for token in tokens {
                token.cancel();
            }
        }
    }

}
