//! Per-invocation handler context.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::message::Message;
use super::MessagesHub;

/// Everything a route handler sees for one invocation: the concrete topic,
/// the matched pattern and its extracted parameters, the session that
/// triggered the invocation (absent for publishers, which outlive any one
/// session), a cancellation token, and a handle back into the hub for
/// publishing.
///
/// Cheap to clone; handlers may move clones into spawned work.
#[derive(Clone)]
pub struct Context {
    cancellation: CancellationToken,
    topic: String,
    pattern: Arc<str>,
    pnames: Arc<[String]>,
    pvalues: Vec<String>,
    session_id: Option<String>,
    hub: Arc<MessagesHub>,
    messages: Arc<Vec<Message>>,
    data: Option<Arc<str>>,
    rendered: Arc<Mutex<String>>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cancellation: CancellationToken,
        topic: String,
        pattern: Arc<str>,
        pnames: Arc<[String]>,
        pvalues: Vec<String>,
        session_id: Option<String>,
        hub: Arc<MessagesHub>,
        messages: Arc<Vec<Message>>,
        data: Option<Arc<str>>,
    ) -> Self {
        Self {
            cancellation,
            topic,
            pattern,
            pnames,
            pvalues,
            session_id,
            hub,
            messages,
            data,
            rendered: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Concrete topic this invocation is for.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registered pattern that matched the topic.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Value of a named pattern parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.pnames
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.pvalues.get(i))
            .map(String::as_str)
    }

    /// Session that triggered this invocation. `None` for publisher tasks.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Fires when the invocation should stop (publisher cancellation or
    /// connection teardown). Long-running handlers must select on this.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Broadcast messages on this invocation's topic.
    pub async fn publish(&self, messages: Vec<Message>) {
        self.hub.broadcast(&self.topic, messages).await;
    }

    /// Messages being relayed to a subscriber; empty for publisher and
    /// client-action invocations.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Raw client action payload; `None` unless the invocation came from a
    /// client `message` command.
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Append a fragment to the invocation's rendered output, which is
    /// written back to the triggering subscription when the handler returns.
    pub fn render(&self, fragment: &str) {
        self.rendered
            .lock()
            .expect("rendered buffer lock should not be poisoned")
            .push_str(fragment);
    }

    /// Rendered output accumulated so far.
    pub fn rendered(&self) -> String {
        self.rendered
            .lock()
            .expect("rendered buffer lock should not be poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::test_context;

    #[test]
    fn params_resolve_by_name() {
        let mut ctx = test_context("/networks/n1/devices/d2");
        ctx.pattern = "/networks/:network/devices/:device".into();
        ctx.pnames = vec!["network".to_owned(), "device".to_owned()].into();
        ctx.pvalues = vec!["n1".to_owned(), "d2".to_owned()];

        assert_eq!(ctx.param("network"), Some("n1"));
        assert_eq!(ctx.param("device"), Some("d2"));
        assert_eq!(ctx.param("missing"), None);
    }

    #[test]
    fn render_accumulates_across_clones() {
        let ctx = test_context("/t");
        let other = ctx.clone();
        ctx.render("<div>");
        other.render("</div>");
        assert_eq!(ctx.rendered(), "<div></div>");
    }
}
