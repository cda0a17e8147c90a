//! Cache change notifications.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::trace;

/// A change published by a [`KeyedCache`](super::KeyedCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent<K> {
    /// The value for this key was loaded or set.
    Updated(K),
    /// The entry was flagged stale.
    Outdated(K),
    /// Every entry was flagged stale.
    AllOutdated,
    /// The entry was removed.
    Deleted(K),
    /// The entity flipped from active to inactive (e.g. a connection closed).
    Closed(K),
    /// The cache was emptied.
    Cleared,
}

impl<K> ResourceEvent<K> {
    pub fn key(&self) -> Option<&K> {
        match self {
            Self::Updated(key)
            | Self::Outdated(key)
            | Self::Deleted(key)
            | Self::Closed(key) => Some(key),
            Self::AllOutdated | Self::Cleared => None,
        }
    }
}

/// Predicate that suppresses a notification when it returns `true`.
pub type Interrupter<K> = Arc<dyn Fn(&ResourceEvent<K>) -> bool + Send + Sync>;

/// Broadcasts [`ResourceEvent`]s to every subscriber, unless an interrupter
/// vetoes the event.
pub struct ResourceNotifier<K> {
    tx: broadcast::Sender<ResourceEvent<K>>,
    interrupters: RwLock<Vec<Interrupter<K>>>,
}

impl<K: Clone + Send + 'static> ResourceNotifier<K> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            interrupters: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent<K>> {
        self.tx.subscribe()
    }

    pub fn add_interrupter<F>(&self, interrupter: F)
    where
        F: Fn(&ResourceEvent<K>) -> bool + Send + Sync + 'static,
    {
        self.interrupters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(interrupter));
    }

    /// Publish `event`. Returns `false` when an interrupter suppressed it.
    pub fn publish(&self, event: ResourceEvent<K>) -> bool {
        let interrupted = self
            .interrupters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|interrupter| interrupter(&event));
        if interrupted {
            return false;
        }
        if self.tx.send(event).is_err() {
            trace!("No subscribers for cache event");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let notifier = ResourceNotifier::<u32>::new(8);
        let mut rx = notifier.subscribe();
        assert!(notifier.publish(ResourceEvent::Updated(7)));
        assert_eq!(rx.recv().await.unwrap(), ResourceEvent::Updated(7));
    }

    #[tokio::test]
    async fn test_interrupter_suppresses_matching_events() {
        let notifier = ResourceNotifier::<u32>::new(8);
        let mut rx = notifier.subscribe();
        notifier.add_interrupter(|event| matches!(event, ResourceEvent::Deleted(_)));

        assert!(!notifier.publish(ResourceEvent::Deleted(1)));
        assert!(notifier.publish(ResourceEvent::Updated(1)));
        assert_eq!(rx.recv().await.unwrap(), ResourceEvent::Updated(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let notifier = ResourceNotifier::<u32>::new(1);
        assert!(notifier.publish(ResourceEvent::Cleared));
    }
}
