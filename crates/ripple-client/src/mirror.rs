//! Local mirrors of server collections.
//!
//! A [`Collection`] holds the documents of one server collection as
//! [`Item`]s, in arrival order. It changes only when a mutation event for
//! its plain collection registration comes back through the poll loop: local
//! writes are sent to the server and show up once their own event returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use ripple_types::document::{self, Document, ItemId};
use ripple_types::{DeliveredEvent, EventKind, FindOptions, ListenDescriptor, MutationEvent};
use serde_json::{Map, Value};

use crate::client::{lock, CallbackId, Client};
use crate::error::Result;

/// Receives every mutation applied to a collection mirror.
pub type ChangeCallback = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

pub(crate) struct CollectionInner {
    name: String,
    client: Client,
    items: RwLock<Vec<Item>>,
    subscribers: Mutex<Vec<(u64, ChangeCallback)>>,
    next_subscriber: AtomicU64,
    callback: OnceLock<CallbackId>,
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        if let Some(id) = self.callback.get() {
            self.client.off(*id);
        }
    }
}

/// Mirror of one server collection. Clones share the same mirror.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Creates an empty mirror and hooks it into the client's poll loop.
    pub(crate) fn attach(client: &Client, name: &str) -> Self {
        let inner = Arc::new(CollectionInner {
            name: name.to_string(),
            client: client.clone(),
            items: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            callback: OnceLock::new(),
        });

        let mirror = Arc::downgrade(&inner);
        let descriptor = ListenDescriptor::collection(name);
        let id = client.on(move |event: &DeliveredEvent| {
            if event.listen != descriptor {
                return;
            }
            let Some(inner) = mirror.upgrade() else { return };
            match event.mutation() {
                Some(mutation) => Collection { inner }.apply(&mutation),
                None => tracing::debug!("ignoring event that is not a mutation"),
            }
        });
        let _ = inner.callback.set(id);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<CollectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<CollectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Item>> {
        self.inner.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Item>> {
        self.inner.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Item> {
        self.read().get(index).cloned()
    }

    /// Snapshot of the mirrored items, in order.
    pub fn items(&self) -> Vec<Item> {
        self.read().clone()
    }

    pub fn filter(&self, predicate: impl Fn(&Item) -> bool) -> Vec<Item> {
        self.read().iter().filter(|item| predicate(item)).cloned().collect()
    }

    pub fn map<T>(&self, f: impl Fn(&Item) -> T) -> Vec<T> {
        self.read().iter().map(f).collect()
    }

    pub fn find_item(&self, id: &str) -> Option<Item> {
        self.read().iter().find(|item| item.id() == id).cloned()
    }

    /// Subscribes to mutations applied to this mirror.
    pub fn on_change<F>(&self, callback: F) -> u64
    where
        F: Fn(&MutationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn off_change(&self, id: u64) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Adds documents not mirrored yet. Documents without an id are skipped.
    pub(crate) fn seed(&self, documents: Vec<Document>) {
        for doc in documents {
            self.adopt(doc);
        }
    }

    /// Mirrors `doc` unless an item with its id already exists, and returns
    /// the mirrored item.
    pub(crate) fn adopt(&self, doc: Document) -> Option<Item> {
        let id = document::item_id(&doc)?;
        let mut items = self.write();
        if let Some(existing) = items.iter().find(|item| item.id() == id) {
            return Some(existing.clone());
        }
        let item = Item::new(self.inner.client.clone(), &self.inner.name, id, doc);
        items.push(item.clone());
        Some(item)
    }

    fn apply(&self, event: &MutationEvent) {
        match event.kind {
            EventKind::Insert => {
                for doc in event.info.inserted() {
                    self.adopt(doc);
                }
            }
            EventKind::Update => {
                let Some(update) = &event.info.update else {
                    tracing::warn!(collection = %self.inner.name, "update event without update document");
                    return;
                };
                for id in event.info.affected_ids() {
                    if let Some(item) = self.find_item(&id) {
                        item.apply_update(update);
                    }
                }
            }
            EventKind::Remove => {
                let ids = event.info.affected_ids();
                let mut items = self.write();
                items.retain(|item| {
                    if ids.iter().any(|id| id == item.id()) {
                        item.mark_removed();
                        false
                    } else {
                        true
                    }
                });
            }
        }

        let subscribers: Vec<ChangeCallback> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }

    // Remote operations scoped to this collection.

    pub async fn insert_one(&self, document: Value) -> Result<ItemId> {
        self.inner.client.insert_one(&self.inner.name, document).await
    }

    pub async fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<ItemId>> {
        self.inner
            .client
            .insert_many(&self.inner.name, documents)
            .await
    }

    pub async fn update_one(&self, filter: Value, update: Value) -> Result<u64> {
        self.inner
            .client
            .update_one(&self.inner.name, filter, update)
            .await
    }

    pub async fn update_many(&self, filter: Value, update: Value) -> Result<u64> {
        self.inner
            .client
            .update_many(&self.inner.name, filter, update)
            .await
    }

    pub async fn remove(&self, filter: Value) -> Result<u64> {
        self.inner.client.remove(&self.inner.name, filter).await
    }

    pub async fn find(&self, filter: Value, options: FindOptions) -> Result<Vec<Document>> {
        self.inner
            .client
            .find(&self.inner.name, filter, options)
            .await
    }

    pub async fn count(&self, filter: Value) -> Result<u64> {
        self.inner.client.count(&self.inner.name, filter).await
    }
}

struct ItemInner {
    id: ItemId,
    collection: String,
    client: Client,
    fields: RwLock<Document>,
    removed: AtomicBool,
}

/// Mirror of one document. Clones share the same fields.
#[derive(Clone)]
pub struct Item {
    inner: Arc<ItemInner>,
}

impl Item {
    fn new(client: Client, collection: &str, id: ItemId, fields: Document) -> Self {
        Self {
            inner: Arc::new(ItemInner {
                id,
                collection: collection.to_string(),
                client,
                fields: RwLock::new(fields),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        let fields = self.inner.fields.read().unwrap_or_else(PoisonError::into_inner);
        document::get_path(&fields, field).cloned()
    }

    /// Snapshot of every mirrored field, identity included.
    pub fn fields(&self) -> Document {
        self.inner
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a remove event for this item has been applied.
    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    fn apply_update(&self, update: &Value) {
        let mut fields = self.inner.fields.write().unwrap_or_else(PoisonError::into_inner);
        match document::apply_update(&fields, update) {
            Ok(updated) => *fields = updated,
            Err(e) => tracing::warn!(id = %self.inner.id, error = %e, "failed to mirror update"),
        }
    }

    fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::SeqCst);
    }

    /// Sends `update` for this item to the server.
    pub async fn update(&self, update: Value) -> Result<u64> {
        self.inner
            .client
            .update_one(&self.inner.collection, document::id_filter(&self.inner.id), update)
            .await
    }

    /// Sets one field on the server.
    pub async fn set(&self, field: &str, value: Value) -> Result<u64> {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value);
        let mut update = Map::new();
        update.insert("$set".to_string(), Value::Object(fields));
        self.update(Value::Object(update)).await
    }

    pub async fn remove(&self) -> Result<u64> {
        self.inner
            .client
            .remove(&self.inner.collection, document::id_filter(&self.inner.id))
            .await
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("collection", &self.inner.collection)
            .field("id", &self.inner.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}
