//! In-memory topic bus.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus keyed by topic.
///
/// - No IO / no async
/// - Unbounded per-subscriber channels, so `publish` never blocks
/// - Dead subscribers are pruned while publishing
#[derive(Debug)]
pub struct InMemoryEventBus<K, M> {
    topics: Mutex<HashMap<K, Vec<mpsc::Sender<M>>>>,
}

impl<K, M> InMemoryEventBus<K, M> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, M> Default for InMemoryEventBus<K, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, M> EventBus<K, M> for InMemoryEventBus<K, M>
where
    K: Eq + Hash + Clone + Send + 'static,
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, topic: &K, message: M) -> Result<usize, Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let Some(subs) = topics.get_mut(topic) else {
            return Ok(0);
        };

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            topics.remove(topic);
        }

        Ok(delivered)
    }

    fn subscribe(&self, topic: K) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned we still hand out a subscription; it reports
        // `Disconnected` right away because the sender is dropped here.
        if let Ok(mut topics) = self.topics.lock() {
            topics.entry(topic).or_default().push(tx);
        }

        Subscription::new(rx)
    }

    fn close(&self, topic: &K) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.remove(topic);
        }
    }

    fn subscriber_count(&self, topic: &K) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
