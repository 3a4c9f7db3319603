//! Turbo Streams channel adapter.
//!
//! Bridges the cable transport to the broker: verifies the signed stream
//! name in the subscription identifier, authorizes through the broker's SUB
//! handler, registers a hub receiver that renders broadcasts through the MSG
//! handler, and routes client actions back through the same handler.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::{
    Broker, Message, MessageHandler, MessagesHub, MsgPayload, SubscribeHandler,
};
use crate::cable::{Channel, ChannelError, ChannelFactory, Subscription, Unsubscriber};
use crate::pubsub::ReceiveFn;

use super::signer::Signer;

/// Channel name stock Turbo clients subscribe with.
pub const CHANNEL_NAME: &str = "Turbo::StreamsChannel";

/// Build the subscription identifier for a signed stream name, as a Turbo
/// client would.
pub fn identifier(signed_stream_name: &str) -> String {
    json!({
        "channel": CHANNEL_NAME,
        "signed_stream_name": signed_stream_name,
    })
    .to_string()
}

/// One stream's endpoint on one connection.
pub struct StreamsChannel {
    identifier: String,
    name: String,
    hub: Arc<MessagesHub>,
    handle_subscribe: SubscribeHandler,
    handle_message: MessageHandler,
    subscribed: Mutex<Option<Subscription>>,
}

impl StreamsChannel {
    /// Fails if the identifier is malformed or its stream name doesn't
    /// verify; nothing downstream ever sees an unverified name.
    pub fn new(
        signer: &Signer,
        identifier: &str,
        hub: Arc<MessagesHub>,
        handle_subscribe: SubscribeHandler,
        handle_message: MessageHandler,
    ) -> Result<Self, ChannelError> {
        let name = signer
            .stream_name_from_identifier(identifier)
            .map_err(|err| ChannelError::Verification(Box::new(err)))?;
        Ok(Self {
            identifier: identifier.to_owned(),
            name,
            hub,
            handle_subscribe,
            handle_message,
            subscribed: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Channel for StreamsChannel {
    async fn subscribe(
        &self,
        _cancel: CancellationToken,
        subscription: Subscription,
    ) -> Result<Option<Unsubscriber>, ChannelError> {
        if subscription.identifier() != self.identifier {
            return Err(ChannelError::IdentifierMismatch);
        }

        if let Err(err) = (self.handle_subscribe)(self.name.clone()).await {
            // Declined: the client sees a bare rejection, nothing more.
            debug!(topic = %self.name, error = %err, "subscription declined");
            return Ok(None);
        }
        *self
            .subscribed
            .lock()
            .expect("subscription slot lock should not be poisoned") = Some(subscription.clone());

        let handle_message = self.handle_message.clone();
        let name = self.name.clone();
        let receive: ReceiveFn<Vec<Message>> = Arc::new(move |messages| {
            let handle_message = handle_message.clone();
            let name = name.clone();
            let subscription = subscription.clone();
            Box::pin(async move {
                match handle_message(name.clone(), MsgPayload::Broadcast(messages)).await {
                    Ok(rendered) => subscription.receive(rendered),
                    Err(err) => {
                        error!(topic = %name, error = %err, "couldn't render broadcast");
                        subscription.close();
                        false
                    }
                }
            })
        });
        let (unsubscriber, _removed) = self.hub.subscribe(&self.name, receive).await;
        Ok(Some(Box::new(move || {
            Box::pin(unsubscriber.unsubscribe())
        })))
    }

    async fn perform(&self, data: &str) -> Result<(), ChannelError> {
        let subscription = self
            .subscribed
            .lock()
            .expect("subscription slot lock should not be poisoned")
            .clone()
            .ok_or(ChannelError::NotSubscribed)?;

        let rendered = (self.handle_message)(self.name.clone(), MsgPayload::Action(data.to_owned()))
            .await
            .map_err(|err| ChannelError::Perform(Box::new(err)))?;
        if !rendered.is_empty() {
            subscription.receive(rendered);
        }
        Ok(())
    }
}

/// Factory building [`StreamsChannel`]s from raw identifiers.
pub fn channel_factory(
    signer: Signer,
    hub: Arc<MessagesHub>,
    handle_subscribe: SubscribeHandler,
    handle_message: MessageHandler,
) -> ChannelFactory {
    Arc::new(move |identifier| {
        Ok(Arc::new(StreamsChannel::new(
            &signer,
            identifier,
            Arc::clone(&hub),
            handle_subscribe.clone(),
            handle_message.clone(),
        )?))
    })
}

/// Factory wired to a broker on behalf of one session; the usual way an
/// application fills the cable endpoint's registry.
pub fn session_channel_factory(
    broker: &Arc<Broker>,
    signer: Signer,
    session_id: &str,
) -> ChannelFactory {
    channel_factory(
        signer,
        broker.hub(),
        broker.subscribe_handler(session_id.to_owned()),
        broker.message_handler(session_id.to_owned()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::broker::HandlerError;
    use crate::cable::ServerMessage;

    fn signer() -> Signer {
        Signer::new(vec![7; 32])
    }

    fn allowing_subscribe(calls: Arc<AtomicUsize>) -> SubscribeHandler {
        Arc::new(move |_topic| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        })
    }

    fn denying_subscribe() -> SubscribeHandler {
        Arc::new(|_topic| Box::pin(async { Err(HandlerError::Unauthorized) }))
    }

    /// Renders each payload as `topic:kind` for assertions.
    fn echoing_message() -> MessageHandler {
        Arc::new(|topic, payload| {
            Box::pin(async move {
                match payload {
                    MsgPayload::Broadcast(messages) => {
                        Ok(format!("{}:broadcast:{}", topic, messages.len()))
                    }
                    MsgPayload::Action(data) => Ok(format!("{}:action:{}", topic, data)),
                }
            })
        })
    }

    struct Fixture {
        channel: StreamsChannel,
        hub: Arc<MessagesHub>,
        identifier: String,
        sub_calls: Arc<AtomicUsize>,
    }

    fn fixture(handle_subscribe: Option<SubscribeHandler>) -> Fixture {
        let (hub, _changes) = MessagesHub::new();
        let sub_calls = Arc::new(AtomicUsize::new(0));
        let identifier = identifier(&signer().sign("/t"));
        let channel = StreamsChannel::new(
            &signer(),
            &identifier,
            Arc::clone(&hub),
            handle_subscribe.unwrap_or_else(|| allowing_subscribe(sub_calls.clone())),
            echoing_message(),
        )
        .unwrap();
        Fixture {
            channel,
            hub,
            identifier,
            sub_calls,
        }
    }

    fn subscription(identifier: &str) -> (Subscription, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Subscription::new(identifier.to_owned(), tx), rx)
    }

    #[test]
    fn tampered_identifier_never_reaches_construction() {
        let (hub, _changes) = MessagesHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let forged = identifier(&Signer::new(vec![9; 32]).sign("/t"));

        let result = StreamsChannel::new(
            &signer(),
            &forged,
            hub,
            allowing_subscribe(calls.clone()),
            echoing_message(),
        );

        assert!(matches!(result, Err(ChannelError::Verification(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscribe_registers_a_hub_receiver_that_renders_broadcasts() {
        let fx = fixture(None);
        let (sub, mut rx) = subscription(&fx.identifier);

        let unsubscriber = fx
            .channel
            .subscribe(CancellationToken::new(), sub)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.sub_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.hub.subscriber_count("/t").await, 1);

        fx.hub.broadcast("/t", Vec::new()).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::data(fx.identifier.clone(), "/t:broadcast:0")
        );

        unsubscriber().await;
        assert_eq!(fx.hub.subscriber_count("/t").await, 0);
    }

    #[tokio::test]
    async fn declined_subscription_registers_nothing() {
        let fx = fixture(Some(denying_subscribe()));
        let (sub, _rx) = subscription(&fx.identifier);

        let outcome = fx
            .channel
            .subscribe(CancellationToken::new(), sub)
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(fx.hub.subscriber_count("/t").await, 0);
    }

    #[tokio::test]
    async fn foreign_identifier_is_a_mismatch() {
        let fx = fixture(None);
        let (sub, _rx) = subscription("some other identifier");

        let err = fx
            .channel
            .subscribe(CancellationToken::new(), sub)
            .await
            .err()
            .expect("expected subscribe to fail");
        assert!(matches!(err, ChannelError::IdentifierMismatch));
    }

    #[tokio::test]
    async fn perform_writes_the_result_back_on_the_subscription() {
        let fx = fixture(None);
        let (sub, mut rx) = subscription(&fx.identifier);
        fx.channel
            .subscribe(CancellationToken::new(), sub)
            .await
            .unwrap()
            .unwrap();

        fx.channel.perform("act").await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::data(fx.identifier.clone(), "/t:action:act")
        );
    }

    #[tokio::test]
    async fn perform_before_subscribe_is_an_error() {
        let fx = fixture(None);
        let err = fx.channel.perform("act").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotSubscribed));
    }
}
