//! In-process publish/subscribe bus.
//!
//! The bus is a topic-indexed multimap: publishing looks up the subscribers of
//! exactly one topic, so dispatch cost does not grow with the total number of
//! subscriptions. Each subscription owns an unbounded channel; a subscription
//! may cover several topics and receives the messages of all of them, in
//! publish order.
//!
//! Dropping a [`Subscription`] unsubscribes it. Unsubscribing is idempotent,
//! so an explicit teardown racing a drop is harmless.

mod topic;

pub use topic::{Channel, Topic};

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;

/// Identifier of one subscription.
pub type SubscriptionId = u64;

struct State<K, M> {
    /// topic -> subscribers.
    topics: HashMap<K, HashMap<SubscriptionId, mpsc::UnboundedSender<M>>>,
    /// Reverse mapping: subscription -> topics.
    subscriptions: HashMap<SubscriptionId, Vec<K>>,
}

struct Inner<K, M> {
    state: RwLock<State<K, M>>,
    next_id: AtomicU64,
    soft_limit: usize,
    name: &'static str,
}

impl<K, M> Inner<K, M> {
    fn read(&self) -> RwLockReadGuard<'_, State<K, M>> {
        self.state.read().unwrap_or_else(|poisoned| {
            tracing::error!(bus = self.name, "bus lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K, M>> {
        self.state.write().unwrap_or_else(|poisoned| {
            tracing::error!(bus = self.name, "bus lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl<K: Eq + Hash, M> Inner<K, M> {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut state = self.write();
        let Some(topics) = state.subscriptions.remove(&id) else {
            return false;
        };
        for topic in topics {
            if let Some(subscribers) = state.topics.get_mut(&topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    state.topics.remove(&topic);
                }
            }
        }
        true
    }
}

/// A topic-keyed publish/subscribe bus. Cloning shares the same bus.
pub struct EventBus<K, M> {
    inner: Arc<Inner<K, M>>,
}

impl<K, M> Clone for EventBus<K, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, M> EventBus<K, M>
where
    K: Eq + Hash + Clone,
    M: Clone,
{
    /// Creates a bus. `soft_limit` is the subscription count above which a
    /// warning is logged on every new subscription; it never rejects.
    pub fn new(name: &'static str, soft_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    topics: HashMap::new(),
                    subscriptions: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                soft_limit,
                name,
            }),
        }
    }

    /// Subscribes to every topic in `topics` with one receiver.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = K>) -> Subscription<K, M> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let topics: Vec<K> = topics.into_iter().collect();

        let total = {
            let mut state = self.inner.write();
            for topic in &topics {
                state
                    .topics
                    .entry(topic.clone())
                    .or_default()
                    .insert(id, tx.clone());
            }
            state.subscriptions.insert(id, topics);
            state.subscriptions.len()
        };

        if total > self.inner.soft_limit {
            tracing::warn!(
                bus = self.inner.name,
                subscriptions = total,
                limit = self.inner.soft_limit,
                "subscription count above configured limit"
            );
        }

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            receiver: rx,
        }
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Delivers `message` to every subscriber of `topic` and returns how many
    /// received it. Subscribers whose receiver is gone are pruned.
    pub fn publish(&self, topic: &K, message: M) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let state = self.inner.read();
            let Some(subscribers) = state.topics.get(topic) else {
                return 0;
            };
            for (id, tx) in subscribers {
                if tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.inner.remove(id);
        }
        delivered
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.inner.read().topics.get(topic).map_or(0, HashMap::len)
    }

    /// Total number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.read().subscriptions.len()
    }
}

/// A live subscription. Unsubscribes when dropped.
pub struct Subscription<K: Eq + Hash, M> {
    id: SubscriptionId,
    bus: Weak<Inner<K, M>>,
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<K: Eq + Hash, M> Subscription<K, M> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next message. Returns `None` once unsubscribed and
    /// drained.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Returns a buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Stops delivery of new messages; already buffered ones stay readable.
    pub fn unsubscribe(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.remove(self.id))
    }
}

impl<K: Eq + Hash, M> Drop for Subscription<K, M> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
