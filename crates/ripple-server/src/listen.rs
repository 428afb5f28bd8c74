//! Listen registrations: bus subscriptions that forward mutations to a
//! session's delivery topic.
//!
//! Each registration owns one task. The task forwards every matching
//! mutation (through the named filter, if any) to the per-token delivery
//! bus, and rechecks its token every idle-timeout period, ending itself once
//! the token is gone. Explicit teardown aborts the task; dropping the task
//! drops its bus subscription, which unsubscribes it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ripple_bus::{EventBus, Subscription, Topic};
use ripple_types::{DeliveredEvent, ListenDescriptor, MutationEvent};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::filters::{FilterFn, FilterRegistry};
use crate::proxy::MutationBus;
use crate::tokens::{TokenError, TokenManager};

/// Per-token delivery topics, keyed by token value.
pub type DeliveryBus = EventBus<String, DeliveredEvent>;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Missing collection name")]
    MissingCollection,

    #[error("Unknown filter {0}")]
    UnknownFilter(String),

    #[error(transparent)]
    Token(#[from] TokenError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListenKey {
    token: String,
    descriptor: ListenDescriptor,
}

struct Entry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Registrations plus an index of each token's descriptors, so a token can
/// be released without scanning every registration.
#[derive(Default)]
struct Registrations {
    entries: HashMap<ListenKey, Entry>,
    by_token: HashMap<String, HashSet<ListenDescriptor>>,
}

impl Registrations {
    fn insert(&mut self, key: ListenKey, entry: Entry) {
        self.by_token
            .entry(key.token.clone())
            .or_default()
            .insert(key.descriptor.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &ListenKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        if let Some(descriptors) = self.by_token.get_mut(&key.token) {
            descriptors.remove(&key.descriptor);
            if descriptors.is_empty() {
                self.by_token.remove(&key.token);
            }
        }
        Some(entry)
    }

    fn remove_token(&mut self, token: &str) -> Vec<Entry> {
        let Some(descriptors) = self.by_token.remove(token) else {
            return Vec::new();
        };
        descriptors
            .into_iter()
            .filter_map(|descriptor| {
                self.entries.remove(&ListenKey {
                    token: token.to_string(),
                    descriptor,
                })
            })
            .collect()
    }
}

struct Inner {
    entries: Mutex<Registrations>,
    next_generation: AtomicU64,
    mutations: MutationBus,
    deliveries: DeliveryBus,
    tokens: TokenManager,
    filters: FilterRegistry,
    recheck: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registrations> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::error!("listen registry lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Removes `key` if it still belongs to the registration of `generation`.
    fn remove_if_current(&self, key: &ListenKey, generation: u64) {
        let mut entries = self.lock();
        if entries.entries.get(key).is_some_and(|e| e.generation == generation) {
            entries.remove(key);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in entries.entries.drain() {
            entry.task.abort();
        }
    }
}

#[derive(Clone)]
pub struct ListenRegistry {
    inner: Arc<Inner>,
}

impl ListenRegistry {
    pub fn new(
        mutations: MutationBus,
        deliveries: DeliveryBus,
        tokens: TokenManager,
        filters: FilterRegistry,
        recheck: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Registrations::default()),
                next_generation: AtomicU64::new(1),
                mutations,
                deliveries,
                tokens,
                filters,
                recheck,
            }),
        }
    }

    /// Starts forwarding mutations matching `descriptor` to `token`'s
    /// delivery topic. Registering the same descriptor twice for a token is a
    /// no-op.
    pub async fn register(
        &self,
        token: &str,
        descriptor: ListenDescriptor,
    ) -> Result<(), ListenError> {
        if descriptor.collection.is_empty() {
            return Err(ListenError::MissingCollection);
        }
        self.inner.tokens.require(token).await?;
        let filter = match &descriptor.filter {
            Some(name) => Some(
                self.inner
                    .filters
                    .get(name)
                    .ok_or_else(|| ListenError::UnknownFilter(name.clone()))?,
            ),
            None => None,
        };

        let key = ListenKey {
            token: token.to_string(),
            descriptor,
        };
        let mut entries = self.inner.lock();
        if entries.entries.contains_key(&key) {
            tracing::debug!(collection = %key.descriptor.collection, "listen already registered");
            return Ok(());
        }

        let collection = key.descriptor.collection.as_str();
        let topics = match &key.descriptor.id {
            Some(id) => Topic::item_touched(collection, id),
            None => Topic::collection_touched(collection),
        };
        let subscription = self.inner.mutations.subscribe(topics);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            key.clone(),
            generation,
            subscription,
            filter,
        ));
        tracing::debug!(
            collection = %key.descriptor.collection,
            id = key.descriptor.id.as_deref().unwrap_or(""),
            filter = key.descriptor.filter.as_deref().unwrap_or(""),
            "listen registered"
        );
        entries.insert(key, Entry { generation, task });
        Ok(())
    }

    /// Stops the registration addressed by `descriptor`. Stopping a
    /// registration that does not exist, or already expired, succeeds.
    pub async fn unregister(
        &self,
        token: &str,
        descriptor: ListenDescriptor,
    ) -> Result<(), ListenError> {
        if descriptor.collection.is_empty() {
            return Err(ListenError::MissingCollection);
        }
        self.inner.tokens.require(token).await?;
        let key = ListenKey {
            token: token.to_string(),
            descriptor,
        };
        if let Some(entry) = self.inner.lock().remove(&key) {
            entry.task.abort();
        }
        Ok(())
    }

    /// Drops every registration of `token`.
    pub fn release_token(&self, token: &str) -> usize {
        let released = self.inner.lock().remove_token(token);
        for entry in &released {
            entry.task.abort();
        }
        released.len()
    }

    pub fn is_registered(&self, token: &str, descriptor: &ListenDescriptor) -> bool {
        let key = ListenKey {
            token: token.to_string(),
            descriptor: descriptor.clone(),
        };
        self.inner.lock().entries.contains_key(&key)
    }

    pub fn registration_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

async fn forward(
    registry: Weak<Inner>,
    key: ListenKey,
    generation: u64,
    mut subscription: Subscription<Topic, MutationEvent>,
    filter: Option<FilterFn>,
) {
    let Some((deliveries, tokens, recheck)) = registry
        .upgrade()
        .map(|inner| (inner.deliveries.clone(), inner.tokens.clone(), inner.recheck))
    else {
        return;
    };

    let mut check = tokio::time::interval_at(Instant::now() + recheck, recheck);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let args = event.to_args();
                let args = match &filter {
                    Some(filter) => filter(args).await,
                    None => args,
                };
                deliveries.publish(
                    &key.token,
                    DeliveredEvent {
                        listen: key.descriptor.clone(),
                        args,
                        id: None,
                    },
                );
            }
            _ = check.tick() => {
                match tokens.is_valid(&key.token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            collection = %key.descriptor.collection,
                            "token expired, dropping listen registration"
                        );
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "listen token recheck failed"),
                }
            }
        }
    }

    drop(subscription);
    if let Some(inner) = registry.upgrade() {
        inner.remove_if_current(&key, generation);
    }
}
