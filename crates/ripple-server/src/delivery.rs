//! Long-poll delivery.
//!
//! A poll waits on its token's delivery topic. The first event ends the idle
//! wait and opens a grouping window; every event received until the window
//! closes is persisted as a queued event. When the window closes, the token's
//! queued events are read back in insertion order, returned as one batch, and
//! deleted.
//!
//! Each token has at most one delivery listener. A poll adopts the parked
//! listener of its token if there is one; after the poll ends the listener
//! stays parked for a quarter of the idle timeout, buffering events, so a
//! promptly reopened poll misses nothing. Concurrent polls for one token take
//! turns on the listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ripple_bus::Subscription;
use ripple_store::StorageAdapter;
use ripple_types::document::{self, Document};
use ripple_types::{DeliveredEvent, FindOptions, ListenDescriptor};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::listen::DeliveryBus;
use crate::tokens::now_ms;

type Listener = Arc<tokio::sync::Mutex<Subscription<String, DeliveredEvent>>>;

struct Parked {
    listener: Listener,
    /// Bumped on every adoption; a grace teardown only removes the listener
    /// if nobody adopted it since.
    generation: u64,
}

struct Inner {
    deliveries: DeliveryBus,
    adapter: Arc<dyn StorageAdapter>,
    events: String,
    idle_timeout: Duration,
    grouping_delay: Duration,
    listeners: Mutex<HashMap<String, Parked>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Parked>> {
        self.listeners.lock().unwrap_or_else(|poisoned| {
            tracing::error!("delivery listener lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn adopt(&self, token: &str) -> (Listener, u64) {
        let mut listeners = self.lock();
        let parked = listeners.entry(token.to_string()).or_insert_with(|| Parked {
            listener: Arc::new(tokio::sync::Mutex::new(
                self.deliveries.subscribe([token.to_string()]),
            )),
            generation: 0,
        });
        parked.generation += 1;
        (parked.listener.clone(), parked.generation)
    }

    fn release(self: &Arc<Self>, token: String, generation: u64) {
        let inner = self.clone();
        let grace = self.idle_timeout / 4;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            inner.remove_if_idle(&token, generation);
            return;
        };
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            inner.remove_if_idle(&token, generation);
        });
    }

    fn remove_if_idle(&self, token: &str, generation: u64) {
        let mut listeners = self.lock();
        if listeners.get(token).is_some_and(|p| p.generation == generation) {
            listeners.remove(token);
            tracing::debug!("delivery listener torn down");
        }
    }
}

/// Hands the listener back when a poll ends, including when the client
/// aborts and the poll future is dropped.
struct Adoption {
    inner: Arc<Inner>,
    token: String,
    generation: u64,
}

impl Drop for Adoption {
    fn drop(&mut self) {
        self.inner
            .release(std::mem::take(&mut self.token), self.generation);
    }
}

#[derive(Clone)]
pub struct DeliveryHub {
    inner: Arc<Inner>,
}

impl DeliveryHub {
    pub fn new(
        deliveries: DeliveryBus,
        adapter: Arc<dyn StorageAdapter>,
        events_collection: String,
        idle_timeout: Duration,
        grouping_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deliveries,
                adapter,
                events: events_collection,
                idle_timeout,
                grouping_delay,
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of tokens with a live or parked listener.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Holds until events arrive for `token` or the idle timeout passes.
    ///
    /// The token must already have been validated.
    pub async fn poll(&self, token: &str) -> Vec<DeliveredEvent> {
        let (listener, generation) = self.inner.adopt(token);
        let _adoption = Adoption {
            inner: self.inner.clone(),
            token: token.to_string(),
            generation,
        };
        let mut subscription = listener.lock().await;

        let filter = json!({"token": token});
        let leftover = match self.inner.adapter.count(&self.inner.events, &filter).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!(error = %e, "failed to count queued events");
                false
            }
        };

        if !leftover {
            match tokio::time::timeout(self.inner.idle_timeout, subscription.recv()).await {
                Ok(Some(event)) => self.persist(token, event).await,
                Ok(None) | Err(_) => return Vec::new(),
            }
        }

        let deadline = Instant::now() + self.inner.grouping_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = subscription.recv() => match event {
                    Some(event) => self.persist(token, event).await,
                    None => break,
                },
            }
        }

        self.take_queued(&filter).await
    }

    async fn persist(&self, token: &str, event: DeliveredEvent) {
        let args = match serde_json::to_string(&event.args) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode event arguments");
                return;
            }
        };
        let mut record = Document::new();
        record.insert("token".to_string(), Value::String(token.to_string()));
        record.insert(
            "listen".to_string(),
            serde_json::to_value(&event.listen).unwrap_or(Value::Null),
        );
        record.insert("args".to_string(), Value::String(args));
        record.insert("createdAt".to_string(), json!(now_ms()));
        if let Err(e) = self
            .inner
            .adapter
            .insert_one(&self.inner.events, record, None)
            .await
        {
            tracing::warn!(error = %e, "failed to queue event");
        }
    }

    /// Reads the token's queued events and deletes the ones returned.
    async fn take_queued(&self, filter: &Value) -> Vec<DeliveredEvent> {
        let rows = match self
            .inner
            .adapter
            .find(&self.inner.events, filter, None, &FindOptions::default())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch queued events, dropping batch");
                return Vec::new();
            }
        };

        let mut ids = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = self.inner.adapter.item_id(row);
            if let Some(id) = &id {
                ids.push(id.clone());
            }
            match decode_queued(row, id) {
                Some(event) => events.push(event),
                None => tracing::warn!("skipping malformed queued event"),
            }
        }

        if !ids.is_empty() {
            let delivered = self.inner.adapter.filter_from_item_ids(&ids);
            if let Err(e) = self
                .inner
                .adapter
                .remove(&self.inner.events, &delivered, None)
                .await
            {
                tracing::warn!(error = %e, "failed to delete delivered events");
            }
        }
        tracing::debug!(count = events.len(), "delivering batch");
        events
    }
}

fn decode_queued(row: &Document, id: Option<String>) -> Option<DeliveredEvent> {
    let listen: ListenDescriptor = serde_json::from_value(row.get("listen")?.clone()).ok()?;
    let args = match document::get_path(row, "args")? {
        Value::String(encoded) => serde_json::from_str(encoded).ok()?,
        Value::Array(args) => args.clone(),
        _ => return None,
    };
    Some(DeliveredEvent { listen, args, id })
}
