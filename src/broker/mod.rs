//! Topic lifecycle orchestration.
//!
//! The [`Broker`] owns a [`Hub`] and a [`Router`]: applications register
//! PUB/SUB/UNSUB/MSG handlers against topic patterns, and `serve` consumes
//! the hub's change stream, starting one publisher task when a topic gains
//! its first subscriber and cancelling it when the last one leaves.

pub mod context;
pub mod handler;
pub mod message;
pub mod router;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pubsub::{Hub, TopicChange};

pub use context::Context;
pub use handler::{apply_middleware, handler, not_found_handler, Handler, HandlerError, Middleware};
pub use message::{Action, Message};
pub use router::{Method, Route, RouteMatch, Router};

/// Hub carrying broadcast message batches.
pub type MessagesHub = Hub<Vec<Message>>;

/// Payload of a MSG invocation: either a hub broadcast being relayed to one
/// subscriber, or a client action arriving over a subscription.
#[derive(Debug, Clone)]
pub enum MsgPayload {
    Broadcast(Vec<Message>),
    Action(String),
}

/// Async callback authorizing one subscription; the transport adapter calls
/// this before registering a hub receiver.
pub type SubscribeHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Async callback processing one MSG payload for a topic, returning the
/// rendered output to write back to the subscription.
pub type MessageHandler = Arc<
    dyn Fn(String, MsgPayload) -> BoxFuture<'static, Result<String, HandlerError>> + Send + Sync,
>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is already serving")]
    AlreadyServing,
}

/// Pub/sub orchestrator: routes topics to handlers and manages publisher
/// task lifecycles off the hub's change stream.
pub struct Broker {
    hub: Arc<MessagesHub>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<TopicChange>>>,
    router: Router<Handler>,
}

impl Broker {
    pub fn new() -> Self {
        let (hub, changes) = Hub::new();
        Self {
            hub,
            changes: Mutex::new(Some(changes)),
            router: Router::new(),
        }
    }

    /// The hub this broker orchestrates. Applications broadcast through it;
    /// transport adapters subscribe receivers on it.
    pub fn hub(&self) -> Arc<MessagesHub> {
        Arc::clone(&self.hub)
    }

    /// All registered routes.
    pub fn routes(&self) -> &[Route] {
        self.router.routes()
    }

    /// Register a publisher for a topic pattern, started while the pattern's
    /// topics have subscribers.
    pub fn on_pub(&mut self, pattern: &str, handler: Handler, middleware: &[Middleware]) -> Route {
        self.add(Method::Pub, pattern, handler, middleware)
    }

    /// Register a subscription authorizer for a topic pattern.
    pub fn on_sub(&mut self, pattern: &str, handler: Handler, middleware: &[Middleware]) -> Route {
        self.add(Method::Sub, pattern, handler, middleware)
    }

    /// Register an unsubscription hook for a topic pattern.
    pub fn on_unsub(&mut self, pattern: &str, handler: Handler, middleware: &[Middleware]) -> Route {
        self.add(Method::Unsub, pattern, handler, middleware)
    }

    /// Register a message processor for a topic pattern, invoked both to
    /// render hub broadcasts per subscriber and to process client actions.
    pub fn on_msg(&mut self, pattern: &str, handler: Handler, middleware: &[Middleware]) -> Route {
        self.add(Method::Msg, pattern, handler, middleware)
    }

    fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> Route {
        let handler = apply_middleware(handler, middleware);
        self.router.add(method, pattern, "", handler)
    }

    /// Consume the hub's change stream, starting and cancelling publisher
    /// tasks so each topic has at most one publisher recorded at a time.
    ///
    /// Single consumer: a second concurrent call fails with
    /// [`BrokerError::AlreadyServing`]. Runs until the change stream closes.
    pub async fn serve(self: &Arc<Self>) -> Result<(), BrokerError> {
        let mut changes = self
            .changes
            .lock()
            .expect("change stream lock should not be poisoned")
            .take()
            .ok_or(BrokerError::AlreadyServing)?;

        info!(routes = self.router.routes().len(), "broker serving");
        let mut publishers: HashMap<String, CancellationToken> = HashMap::new();
        let mut pvalues: Vec<String> = Vec::new();
        while let Some(change) = changes.recv().await {
            for topic in change.added {
                if publishers.contains_key(&topic) {
                    continue;
                }
                if let Some(cancel) = self.start_publisher(&topic, &mut pvalues) {
                    publishers.insert(topic, cancel);
                }
            }
            for topic in change.removed {
                if let Some(cancel) = publishers.remove(&topic) {
                    cancel.cancel();
                }
            }
        }

        for (_, cancel) in publishers.drain() {
            cancel.cancel();
        }
        Ok(())
    }

    fn start_publisher(&self, topic: &str, pvalues: &mut Vec<String>) -> Option<CancellationToken> {
        let matched = self.router.find(Method::Pub, topic, pvalues);
        let Some(handler) = matched.handler else {
            debug!(topic, "no publisher registered for activated topic");
            return None;
        };

        let cancel = CancellationToken::new();
        let ctx = Context::new(
            cancel.clone(),
            topic.to_owned(),
            matched.path,
            matched.pnames,
            pvalues.clone(),
            None,
            self.hub(),
            Arc::new(Vec::new()),
            None,
        );
        let topic = topic.to_owned();
        tokio::spawn(async move {
            debug!(topic = %topic, "publisher started");
            match handler(ctx).await {
                Ok(()) => debug!(topic = %topic, "publisher finished"),
                Err(err) if err.is_cancelled() => debug!(topic = %topic, "publisher cancelled"),
                Err(err) => error!(topic = %topic, error = %err, "publisher failed"),
            }
        });
        Some(cancel)
    }

    /// Run the SUB handler for a concrete topic on behalf of a session.
    /// An error means the subscription is not authorized.
    pub async fn handle_sub(&self, session_id: &str, topic: &str) -> Result<(), HandlerError> {
        let mut pvalues = Vec::new();
        let matched = self.router.find(Method::Sub, topic, &mut pvalues);
        let handler = matched.handler.unwrap_or_else(not_found_handler);
        let ctx = Context::new(
            CancellationToken::new(),
            topic.to_owned(),
            matched.path,
            matched.pnames,
            pvalues,
            Some(session_id.to_owned()),
            self.hub(),
            Arc::new(Vec::new()),
            None,
        );
        handler(ctx).await
    }

    /// Run the MSG handler for a concrete topic, returning its rendered
    /// output.
    pub async fn handle_msg(
        &self,
        session_id: &str,
        topic: &str,
        payload: MsgPayload,
    ) -> Result<String, HandlerError> {
        let mut pvalues = Vec::new();
        let matched = self.router.find(Method::Msg, topic, &mut pvalues);
        let handler = matched.handler.unwrap_or_else(not_found_handler);

        let (messages, data) = match payload {
            MsgPayload::Broadcast(messages) => (Arc::new(messages), None),
            MsgPayload::Action(data) => (Arc::new(Vec::new()), Some(Arc::from(data.as_str()))),
        };
        let ctx = Context::new(
            CancellationToken::new(),
            topic.to_owned(),
            matched.path,
            matched.pnames,
            pvalues,
            Some(session_id.to_owned()),
            self.hub(),
            messages,
            data,
        );
        let output = ctx.clone();
        handler(ctx).await?;
        Ok(output.rendered())
    }

    /// Subscription authorizer bound to one session, for handing to a
    /// transport adapter.
    pub fn subscribe_handler(self: &Arc<Self>, session_id: String) -> SubscribeHandler {
        let broker = Arc::clone(self);
        Arc::new(move |topic: String| {
            let broker = Arc::clone(&broker);
            let session_id = session_id.clone();
            Box::pin(async move { broker.handle_sub(&session_id, &topic).await })
        })
    }

    /// Message processor bound to one session, for handing to a transport
    /// adapter.
    pub fn message_handler(self: &Arc<Self>, session_id: String) -> MessageHandler {
        let broker = Arc::clone(self);
        Arc::new(move |topic: String, payload: MsgPayload| {
            let broker = Arc::clone(&broker);
            let session_id = session_id.clone();
            Box::pin(async move { broker.handle_msg(&session_id, &topic, payload).await })
        })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_context(topic: &str) -> Context {
    let (hub, _changes) = MessagesHub::new();
    Context::new(
        CancellationToken::new(),
        topic.to_owned(),
        Arc::from(""),
        Arc::from(Vec::new()),
        Vec::new(),
        None,
        hub,
        Arc::new(Vec::new()),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pubsub::ReceiveFn;

    fn noop_receiver() -> ReceiveFn<Vec<Message>> {
        Arc::new(|_| Box::pin(async { true }))
    }

    #[tokio::test]
    async fn publisher_starts_on_activation_and_stops_on_deactivation() {
        #[derive(Debug, PartialEq)]
        enum Event {
            Started,
            Stopped,
        }
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let mut broker = Broker::new();
        broker.on_pub(
            "/t/:id",
            handler(move |ctx: Context| {
                let events_tx = events_tx.clone();
                async move {
                    let _ = events_tx.send(Event::Started);
                    ctx.cancellation().cancelled().await;
                    let _ = events_tx.send(Event::Stopped);
                    Err(HandlerError::Cancelled)
                }
            }),
            &[],
        );

        let broker = Arc::new(broker);
        let serving = Arc::clone(&broker);
        tokio::spawn(async move { serving.serve().await });

        let hub = broker.hub();
        let (unsub, _) = hub.subscribe("/t/1", noop_receiver()).await;
        let started = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert_eq!(started, Some(Event::Started));

        unsub.unsubscribe().await;
        let stopped = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert_eq!(stopped, Some(Event::Stopped));
    }

    #[tokio::test]
    async fn second_subscriber_does_not_start_a_second_publisher() {
        let (starts_tx, mut starts) = mpsc::unbounded_channel();

        let mut broker = Broker::new();
        broker.on_pub(
            "/t",
            handler(move |ctx: Context| {
                let starts_tx = starts_tx.clone();
                async move {
                    let _ = starts_tx.send(());
                    ctx.cancellation().cancelled().await;
                    Err(HandlerError::Cancelled)
                }
            }),
            &[],
        );

        let broker = Arc::new(broker);
        let serving = Arc::clone(&broker);
        tokio::spawn(async move { serving.serve().await });

        let hub = broker.hub();
        let (_u1, _) = hub.subscribe("/t", noop_receiver()).await;
        let (_u2, _) = hub.subscribe("/t", noop_receiver()).await;

        tokio::time::timeout(Duration::from_secs(1), starts.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(starts.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_sub_rejects_unregistered_topics() {
        let broker = Arc::new(Broker::new());
        let err = broker.handle_sub("s1", "/unknown").await.unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(topic) if topic == "/unknown"));
    }

    #[tokio::test]
    async fn handle_sub_passes_session_to_the_handler() {
        let mut broker = Broker::new();
        broker.on_sub(
            "/private/:user",
            handler(|ctx: Context| async move {
                if ctx.session_id() == ctx.param("user") {
                    Ok(())
                } else {
                    Err(HandlerError::Unauthorized)
                }
            }),
            &[],
        );
        let broker = Arc::new(broker);

        broker.handle_sub("alice", "/private/alice").await.unwrap();
        let err = broker.handle_sub("mallory", "/private/alice").await.unwrap_err();
        assert!(matches!(err, HandlerError::Unauthorized));
    }

    #[tokio::test]
    async fn handle_msg_returns_rendered_output() {
        let mut broker = Broker::new();
        broker.on_msg(
            "/t/:id",
            handler(|ctx: Context| async move {
                for message in ctx.messages() {
                    ctx.render(&format!("<{}>", message.target));
                }
                if let Some(data) = ctx.data() {
                    ctx.render(data);
                }
                Ok(())
            }),
            &[],
        );
        let broker = Arc::new(broker);

        let rendered = broker
            .handle_msg(
                "s1",
                "/t/1",
                MsgPayload::Broadcast(vec![
                    Message::new(Action::Remove, "a"),
                    Message::new(Action::Remove, "b"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(rendered, "<a><b>");

        let rendered = broker
            .handle_msg("s1", "/t/1", MsgPayload::Action("act".to_owned()))
            .await
            .unwrap();
        assert_eq!(rendered, "act");
    }

    #[tokio::test]
    async fn serve_is_single_consumer() {
        let broker = Arc::new(Broker::new());
        let serving = Arc::clone(&broker);
        tokio::spawn(async move { serving.serve().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = broker.serve().await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyServing));
    }
}
