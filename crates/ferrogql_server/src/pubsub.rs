//! In-process publish/subscribe hub feeding subscription resolvers.

use ferrogql_runtime::EventStream;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const DEFAULT_CAPACITY: usize = 256;

type Channels = Arc<RwLock<FxHashMap<String, broadcast::Sender<Value>>>>;

/// A publish/subscribe hub keyed by topic.
#[derive(Clone)]
pub struct PubSub {
    channels: Channels,
    capacity: usize,
}

/// The state behind a `subscribe_stream` stream.
///
/// Fields drop in order, so the receiver is gone by the time `prune` runs.
struct TopicStream {
    receiver: broadcast::Receiver<Value>,
    prune: PruneOnDrop,
}

struct PruneOnDrop {
    topic: String,
    channels: Channels,
}

impl PruneOnDrop {
    fn prune(channels: &mut FxHashMap<String, broadcast::Sender<Value>>, topic: &str) {
        if channels
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(topic);
        }
    }
}

impl Drop for PruneOnDrop {
    fn drop(&mut self) {
        if let Ok(mut channels) = self.channels.try_write() {
            Self::prune(&mut channels, &self.topic);
            return;
        }
        // Contended: finish on the runtime, or leave it to `cleanup`.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let topic = std::mem::take(&mut self.topic);
            let channels = Arc::clone(&self.channels);
            runtime.spawn(async move {
                Self::prune(&mut *channels.write().await, &topic);
            });
        }
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(FxHashMap::default())),
            capacity: capacity.max(1),
        }
    }

    /// Publishes `event` and returns how many subscribers received it.
    pub async fn publish(&self, topic: impl AsRef<str>, event: Value) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(topic.as_ref())
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> broadcast::Receiver<Value> {
        let topic = topic.into();
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(&topic) {
            sender.subscribe()
        } else {
            let (sender, receiver) = broadcast::channel(self.capacity);
            channels.insert(topic, sender);
            receiver
        }
    }

    /// Subscribes to `topic` as a source stream for a subscription field.
    ///
    /// Events a slow receiver missed are skipped. Dropping the last stream
    /// of a topic removes the topic.
    pub async fn subscribe_stream(&self, topic: impl Into<String>) -> EventStream {
        let topic = topic.into();
        let receiver = self.subscribe(topic.clone()).await;
        let state = TopicStream {
            receiver,
            prune: PruneOnDrop {
                topic,
                channels: Arc::clone(&self.channels),
            },
        };
        futures::stream::unfold(state, |mut state| async move {
            loop {
                match state.receiver.recv().await {
                    Ok(value) => return Some((Ok(value), state)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %state.prune.topic, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub async fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriber_count(topic).await > 0
    }

    /// Drops topics nobody listens to anymore.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.publish("nobody", json!(1)).await, 0);
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_stream_receives_in_order() {
        let pubsub = PubSub::new();
        let mut stream = pubsub.subscribe_stream("messages").await;
        assert!(pubsub.has_subscribers("messages").await);

        assert_eq!(pubsub.publish("messages", json!("a")).await, 1);
        assert_eq!(pubsub.publish("messages", json!("b")).await, 1);

        assert_eq!(stream.next().await.unwrap().unwrap(), json!("a"));
        assert_eq!(stream.next().await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_lagged_events_are_skipped() {
        let pubsub = PubSub::with_capacity(2);
        let mut stream = pubsub.subscribe_stream("t").await;
        for n in 0..5 {
            pubsub.publish("t", json!(n)).await;
        }
        // Only the newest events survive in the ring buffer.
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(3));
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_topics() {
        let pubsub = PubSub::new();
        let receiver = pubsub.subscribe("t").await;
        drop(receiver);
        assert!(!pubsub.has_subscribers("t").await);
        assert_eq!(pubsub.topic_count().await, 1);
        pubsub.cleanup().await;
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropping_last_stream_removes_topic() {
        let pubsub = PubSub::new();
        let first = pubsub.subscribe_stream("t").await;
        let mut second = pubsub.subscribe_stream("t").await;

        drop(first);
        assert_eq!(pubsub.subscriber_count("t").await, 1);
        assert_eq!(pubsub.topic_count().await, 1);

        // Parks the receiver inside a pending poll before the drop.
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(10), second.next()).await;
        assert!(pending.is_err());
        drop(second);
        assert_eq!(pubsub.topic_count().await, 0);
        assert_eq!(pubsub.publish("t", json!(1)).await, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_after_prune() {
        let pubsub = PubSub::new();
        drop(pubsub.subscribe_stream("t").await);
        let mut stream = pubsub.subscribe_stream("t").await;
        assert_eq!(pubsub.topic_count().await, 1);
        assert_eq!(pubsub.publish("t", json!("again")).await, 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), json!("again"));
    }
}
