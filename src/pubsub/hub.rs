//! Topic-addressed broadcast hub.
//!
//! Receivers are registered per topic under a read/write lock; broadcasts
//! read-lock the registry, deliver to every current receiver concurrently
//! and join before returning, so one broadcast's deliveries are serialized
//! relative to subscriber-set mutation. A receiver that reports failure
//! (returns `false`) is removed in a follow-up write-locked pass.
//!
//! Backpressure policy: receivers must not block. A receiver that cannot
//! accept a message reports `false` and is dropped rather than buffered
//! against — slow consumers lose messages instead of stalling the broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Receiver callback invoked once per broadcast on the subscribed topic.
///
/// Returns `true` to stay subscribed; `false` to be removed from the hub.
pub type ReceiveFn<M> = Arc<dyn Fn(M) -> BoxFuture<'static, bool> + Send + Sync>;

/// A batch of topic activations and deactivations, emitted whenever a
/// topic's subscriber count crosses 0↔1 (or topics are force-cancelled).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicChange {
    /// Topics that gained their first subscriber.
    pub added: Vec<String>,
    /// Topics that lost their last subscriber.
    pub removed: Vec<String>,
}

struct Receiver<M> {
    receive: ReceiveFn<M>,
    removed: CancellationToken,
}

/// In-memory pub/sub registry mapping topics to receiver callbacks.
///
/// Thread-safe; the only state in the subsystem mutated by multiple tasks
/// concurrently. Change events for one topic are emitted in occurrence
/// order into a single unbounded channel with a single consumer.
pub struct Hub<M> {
    receivers: RwLock<HashMap<String, HashMap<Uuid, Receiver<M>>>>,
    changes: mpsc::UnboundedSender<TopicChange>,
}

impl<M: Clone + Send + Sync + 'static> Hub<M> {
    /// Create a hub and the change-event stream it reports into.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TopicChange>) {
        let (changes, change_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                receivers: RwLock::new(HashMap::new()),
                changes,
            }),
            change_rx,
        )
    }

    /// Register a receiver on a topic.
    ///
    /// The first receiver on a topic emits an activation event. Returns an
    /// [`Unsubscriber`] and a liveness token that fires when the receiver is
    /// removed for any reason (unsubscribe, failed delivery, or forced
    /// cancellation).
    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        receive: ReceiveFn<M>,
    ) -> (Unsubscriber<M>, CancellationToken) {
        let id = Uuid::new_v4();
        let removed = CancellationToken::new();

        let mut receivers = self.receivers.write().await;
        let broadcasting = receivers.entry(topic.to_owned()).or_default();
        let added_topic = broadcasting.is_empty();
        broadcasting.insert(
            id,
            Receiver {
                receive,
                removed: removed.clone(),
            },
        );

        if added_topic {
            // Emitted under the write lock so activation order matches
            // subscription order.
            let _ = self.changes.send(TopicChange {
                added: vec![topic.to_owned()],
                ..TopicChange::default()
            });
        }

        (
            Unsubscriber {
                hub: Arc::clone(self),
                topic: topic.to_owned(),
                id,
            },
            removed,
        )
    }

    /// Deliver a message to every current receiver of a topic.
    ///
    /// A topic with no receivers is a no-op. Receivers that report failure
    /// are unsubscribed after delivery completes.
    pub async fn broadcast(&self, topic: &str, message: M) {
        let rejected = {
            let receivers = self.receivers.read().await;
            let Some(broadcasting) = receivers.get(topic) else {
                return;
            };
            let deliveries = broadcasting.iter().map(|(id, receiver)| {
                let delivery = (receiver.receive)(message.clone());
                let id = *id;
                async move { (id, delivery.await) }
            });
            join_all(deliveries)
                .await
                .into_iter()
                .filter_map(|(id, ok)| (!ok).then_some(id))
                .collect::<Vec<_>>()
        };
        self.remove(topic, &rejected).await;
    }

    /// Force-remove all receivers of the given topics and emit deactivation
    /// immediately.
    pub async fn cancel(&self, topics: &[String]) {
        if topics.is_empty() {
            return;
        }

        let mut receivers = self.receivers.write().await;
        for topic in topics {
            if let Some(broadcasting) = receivers.remove(topic) {
                for (_, receiver) in broadcasting {
                    receiver.removed.cancel();
                }
            }
        }
        let _ = self.changes.send(TopicChange {
            removed: topics.to_vec(),
            ..TopicChange::default()
        });
    }

    /// Number of receivers currently subscribed to a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.receivers
            .read()
            .await
            .get(topic)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    async fn remove(&self, topic: &str, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }

        let mut receivers = self.receivers.write().await;
        let Some(broadcasting) = receivers.get_mut(topic) else {
            return;
        };
        for id in ids {
            if let Some(receiver) = broadcasting.remove(id) {
                receiver.removed.cancel();
            }
        }
        if broadcasting.is_empty() {
            receivers.remove(topic);
            let _ = self.changes.send(TopicChange {
                removed: vec![topic.to_owned()],
                ..TopicChange::default()
            });
        }
    }
}

/// Handle removing one receiver from the hub.
///
/// Safe to invoke after the receiver is already gone (idempotent).
pub struct Unsubscriber<M> {
    hub: Arc<Hub<M>>,
    topic: String,
    id: Uuid,
}

impl<M: Clone + Send + Sync + 'static> Unsubscriber<M> {
    pub async fn unsubscribe(self) {
        self.hub.remove(&self.topic, &[self.id]).await;
    }

    /// Topic this unsubscriber targets.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_receiver(counter: Arc<AtomicUsize>, keep: bool) -> ReceiveFn<String> {
        Arc::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                keep
            })
        })
    }

    #[tokio::test]
    async fn first_subscriber_activates_topic() {
        let (hub, mut changes) = Hub::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _sub1 = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;
        let _sub2 = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;

        let change = changes.recv().await.unwrap();
        assert_eq!(change.added, vec!["/t".to_string()]);
        // Second subscriber must not re-activate.
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_receiver_exactly_once() {
        let (hub, _changes) = Hub::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _s1 = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;
        let _s2 = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;
        let _s3 = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;

        hub.broadcast("/t", "m".to_string()).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn receiver_reporting_failure_is_removed() {
        let (hub, _changes) = Hub::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (_unsub, removed) = hub.subscribe("/t", counting_receiver(counter.clone(), false)).await;

        hub.broadcast("/t", "m".to_string()).await;

        assert_eq!(hub.subscriber_count("/t").await, 0);
        assert!(removed.is_cancelled());
        // A second broadcast must not reach the removed receiver.
        hub.broadcast("/t", "m".to_string()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_deactivates_topic() {
        let (hub, mut changes) = Hub::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (unsub1, _) = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;
        let (unsub2, _) = hub.subscribe("/t", counting_receiver(counter.clone(), true)).await;
        assert_eq!(changes.recv().await.unwrap().added, vec!["/t".to_string()]);

        unsub1.unsubscribe().await;
        assert!(changes.try_recv().is_err());

        unsub2.unsubscribe().await;
        let change = changes.recv().await.unwrap();
        assert_eq!(change.removed, vec!["/t".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_after_cancel_is_a_noop() {
        let (hub, mut changes) = Hub::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (unsub, removed) = hub.subscribe("/t", counting_receiver(counter, true)).await;
        assert_eq!(changes.recv().await.unwrap().added, vec!["/t".to_string()]);

        hub.cancel(&["/t".to_string()]).await;
        assert!(removed.is_cancelled());
        assert_eq!(changes.recv().await.unwrap().removed, vec!["/t".to_string()]);

        // Double removal must not error or emit a second deactivation.
        unsub.unsubscribe().await;
        assert!(changes.try_recv().is_err());
        assert_eq!(hub.subscriber_count("/t").await, 0);
    }

    #[tokio::test]
    async fn broadcast_to_unknown_topic_is_a_noop() {
        let (hub, _changes) = Hub::<String>::new();
        hub.broadcast("/nope", "m".to_string()).await;
    }
}
