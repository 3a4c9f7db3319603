//! Channel abstraction between the transport and application logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::subscription::Subscription;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("couldn't parse subscription identifier")]
    MalformedIdentifier(#[source] serde_json::Error),
    #[error("no factory registered for channel {0}")]
    UnknownChannel(String),
    #[error("subscription identifier doesn't belong to this channel")]
    IdentifierMismatch,
    #[error("no confirmed subscription for identifier {0}")]
    NoSubscription(String),
    #[error("channel is not subscribed")]
    NotSubscribed,
    #[error("stream name failed verification")]
    Verification(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("channel action failed")]
    Perform(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Cleanup callback recorded per confirmed subscription and run at
/// unsubscribe or connection teardown.
pub type Unsubscriber = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + Sync>;

/// Application-side endpoint of subscriptions with a particular identifier.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Attempt to subscribe. `Ok(Some(unsubscriber))` confirms; `Ok(None)`
    /// declines without error detail; `Err` is a processing failure. The
    /// token fires when the connection is torn down.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        subscription: Subscription,
    ) -> Result<Option<Unsubscriber>, ChannelError>;

    /// Handle a client action arriving on a confirmed subscription.
    async fn perform(&self, data: &str) -> Result<(), ChannelError>;
}

/// Constructor for a channel instance from a full identifier string.
pub type ChannelFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Channel>, ChannelError> + Send + Sync>;

/// Extract the `channel` field from an identifier string.
pub fn parse_channel_name(identifier: &str) -> Result<String, ChannelError> {
    #[derive(Deserialize)]
    struct Identifier {
        channel: String,
    }
    serde_json::from_str::<Identifier>(identifier)
        .map(|i| i.channel)
        .map_err(ChannelError::MalformedIdentifier)
}

/// Per-connection channel registry: routes subscribe/perform by identifier,
/// caching one channel instance per identifier so a re-subscribe after an
/// unsubscribe reuses it.
pub struct ChannelDispatcher {
    factories: HashMap<String, ChannelFactory>,
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelDispatcher {
    pub fn new(factories: HashMap<String, ChannelFactory>) -> Self {
        Self {
            factories,
            channels: HashMap::new(),
        }
    }

    /// Route a subscribe command to the channel named in the identifier.
    ///
    /// A cached instance that fails to re-subscribe is evicted so the next
    /// attempt starts fresh.
    pub async fn subscribe(
        &mut self,
        cancel: CancellationToken,
        subscription: Subscription,
    ) -> Result<Option<Unsubscriber>, ChannelError> {
        let identifier = subscription.identifier().to_owned();

        if let Some(existing) = self.channels.get(&identifier) {
            return match existing.subscribe(cancel, subscription).await {
                Ok(Some(unsubscriber)) => Ok(Some(unsubscriber)),
                declined_or_failed => {
                    self.channels.remove(&identifier);
                    declined_or_failed
                }
            };
        }

        let name = parse_channel_name(&identifier)?;
        let factory = self
            .factories
            .get(&name)
            .ok_or(ChannelError::UnknownChannel(name))?;
        let channel = factory(&identifier)?;
        match channel.subscribe(cancel, subscription).await {
            Ok(Some(unsubscriber)) => {
                self.channels.insert(identifier, channel);
                Ok(Some(unsubscriber))
            }
            declined_or_failed => declined_or_failed,
        }
    }

    /// Route a client action to the channel holding the identifier's
    /// confirmed subscription.
    pub async fn perform(&self, identifier: &str, data: &str) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .get(identifier)
            .ok_or_else(|| ChannelError::NoSubscription(identifier.to_owned()))?;
        channel.perform(data).await
    }
}
