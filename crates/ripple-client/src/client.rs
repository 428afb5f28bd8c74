//! Connection bootstrap, the long-poll loop and the remote call surface.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use reqwest::StatusCode;
use ripple_types::document::{self, Document, ItemId};
use ripple_types::{
    DeliveredEvent, FindOptions, ListenDescriptor, ListenRequest, PollResponse, ProxyMethod,
    ProxyRequest, ProxyResponse, ReadyResponse, StatusResponse, DEFAULT_URL_PREFIX,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::mirror::{Collection, CollectionInner, Item};

/// Receives every delivered event, once per relay id.
pub type EventCallback = Arc<dyn Fn(&DeliveredEvent) + Send + Sync>;

/// Handle returned by [`Client::on`], used to unregister the callback.
pub type CallbackId = u64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How many relay ids each callback remembers. Redeliveries only happen
/// within one poll cycle, so older ids can be forgotten.
const SEEN_CAPACITY: usize = 4096;

/// Relay ids already handed to one callback, oldest evicted first.
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Records `id`, returning `false` if it is still remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Callback {
    id: CallbackId,
    handler: EventCallback,
    seen: Mutex<RecentIds>,
}

impl Callback {
    fn first_sight(&self, event: &DeliveredEvent) -> bool {
        match &event.id {
            Some(id) => lock(&self.seen).insert(id),
            None => true,
        }
    }
}

struct Inner {
    http: reqwest::Client,
    /// Server root joined with the route prefix, ending in `/`.
    base: String,
    connect_timeout: Option<Duration>,
    retry_delay: Duration,
    token: OnceCell<Result<String>>,
    closed: AtomicBool,
    callbacks: Mutex<Vec<Arc<Callback>>>,
    next_callback: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
    collections: Mutex<HashMap<String, Weak<CollectionInner>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let poller = self.poller.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }
}

/// A session with a ripple sync server.
///
/// Cloning is cheap; clones share the session token, the poll loop and the
/// collection mirrors.
///
/// ```rust,no_run
/// # async fn example() -> ripple_client::Result<()> {
/// let client = ripple_client::Client::builder()
///     .base_url("http://127.0.0.1:3000")
///     .build()?;
///
/// let tasks = client.get_collection("tasks").await?;
/// tasks.insert_one(serde_json::json!({"title": "write docs"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.inner.base)
    }

    // ---- session ----

    /// Resolves to the session token, requesting admission on first use.
    ///
    /// Admission is retried until it succeeds, the connect timeout passes, or
    /// the server refuses for good (too many connections). The outcome is
    /// cached and shared by every caller.
    pub async fn ready(&self) -> Result<String> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.inner
            .token
            .get_or_init(|| self.connect())
            .await
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<String> {
        let attempts = async {
            loop {
                match self.admit().await {
                    Ok(token) => return Ok(token),
                    Err(ClientError::TooManyConnections) => {
                        return Err(ClientError::TooManyConnections)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "admission failed, retrying");
                        tokio::time::sleep(self.inner.retry_delay).await;
                    }
                }
            }
        };
        match self.inner.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .unwrap_or(Err(ClientError::ConnectTimeout)),
            None => attempts.await,
        }
    }

    async fn admit(&self) -> Result<String> {
        let response = self.inner.http.get(self.url("ready")).send().await?;
        let ready: ReadyResponse = decode(response).await?;
        tracing::debug!("session admitted");
        Ok(ready.token)
    }

    /// Releases the session token and stops the poll loop. Every later call
    /// fails with [`ClientError::Closed`].
    pub async fn quit(&self) -> Result<()> {
        let token = self.ready().await?;
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.poller).take() {
            handle.abort();
        }
        let response = self
            .inner
            .http
            .get(self.url(&format!("quit?token={token}")))
            .send()
            .await?;
        decode::<StatusResponse>(response).await?;
        Ok(())
    }

    // ---- event fan-out ----

    /// Registers `callback` for every delivered event and starts the poll
    /// loop if it is not running. Must be called within a Tokio runtime.
    pub fn on<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&DeliveredEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.callbacks).push(Arc::new(Callback {
            id,
            handler: Arc::new(callback),
            seen: Mutex::new(RecentIds::with_capacity(SEEN_CAPACITY)),
        }));
        self.ensure_polling();
        id
    }

    /// Unregisters a callback. The poll loop stops with the last one.
    pub fn off(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.inner.callbacks);
        let before = callbacks.len();
        callbacks.retain(|callback| callback.id != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            if let Some(handle) = lock(&self.inner.poller).take() {
                handle.abort();
            }
        }
        removed
    }

    /// Hands `events` to every registered callback, skipping events a
    /// callback has already seen.
    pub fn trigger(&self, events: &[DeliveredEvent]) {
        let callbacks: Vec<Arc<Callback>> = lock(&self.inner.callbacks).clone();
        for callback in &callbacks {
            for event in events {
                if callback.first_sight(event) {
                    (callback.handler)(event);
                }
            }
        }
    }

    fn has_callbacks(&self) -> bool {
        !lock(&self.inner.callbacks).is_empty()
    }

    fn ensure_polling(&self) {
        if self.is_closed() {
            return;
        }
        let mut poller = lock(&self.inner.poller);
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *poller = Some(tokio::spawn(poll_loop(Arc::downgrade(&self.inner))));
    }

    /// Issues one long poll and returns its batch.
    pub async fn poll(&self) -> Result<Vec<DeliveredEvent>> {
        let token = self.ready().await?;
        let response = self
            .inner
            .http
            .get(self.url(&format!("on?token={token}")))
            .send()
            .await?;
        let batch: PollResponse = decode(response).await?;
        Ok(batch.events)
    }

    // ---- listen registrations ----

    pub async fn listen(&self, descriptor: &ListenDescriptor) -> Result<()> {
        self.post_listen("listen", descriptor).await
    }

    pub async fn stop_listening(&self, descriptor: &ListenDescriptor) -> Result<()> {
        self.post_listen("listen/stop", descriptor).await
    }

    pub async fn listen_collection(&self, collection: &str) -> Result<()> {
        self.listen(&ListenDescriptor::collection(collection)).await
    }

    pub async fn stop_listen_collection(&self, collection: &str) -> Result<()> {
        self.stop_listening(&ListenDescriptor::collection(collection))
            .await
    }

    pub async fn listen_item(&self, collection: &str, id: &str) -> Result<()> {
        self.listen(&ListenDescriptor::new(collection, Some(id), None::<String>))
            .await
    }

    pub async fn stop_listen_item(&self, collection: &str, id: &str) -> Result<()> {
        self.stop_listening(&ListenDescriptor::new(collection, Some(id), None::<String>))
            .await
    }

    async fn post_listen(&self, route: &str, descriptor: &ListenDescriptor) -> Result<()> {
        let token = self.ready().await?;
        let body = ListenRequest {
            token,
            collection: Some(descriptor.collection.clone()),
            id: descriptor.id.clone(),
            filter: descriptor.filter.clone(),
        };
        let response = self
            .inner
            .http
            .post(self.url(route))
            .json(&body)
            .send()
            .await?;
        decode::<StatusResponse>(response).await?;
        Ok(())
    }

    // ---- proxied calls ----

    /// Sends a raw proxied call and returns the server's `result`.
    pub async fn call(&self, method: ProxyMethod, args: Vec<Value>) -> Result<Value> {
        let token = self.ready().await?;
        let route = match method.mode() {
            ripple_types::AccessMode::Emit => "emit",
            ripple_types::AccessMode::Data => "data",
        };
        let body = ProxyRequest {
            token,
            method: method.as_str().to_string(),
            args: Value::Array(args),
        };
        let response = self
            .inner
            .http
            .post(self.url(route))
            .json(&body)
            .send()
            .await?;
        let reply: ProxyResponse = decode(response).await?;
        Ok(reply.result)
    }

    /// Inserts one document and returns its generated id.
    pub async fn insert_one(&self, collection: &str, document: Value) -> Result<ItemId> {
        let result = self
            .call(
                ProxyMethod::InsertOne,
                vec![Value::String(collection.to_string()), document],
            )
            .await?;
        inserted_ids(&result)?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Decode("insert returned no id".to_string()))
    }

    pub async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<ItemId>> {
        let result = self
            .call(
                ProxyMethod::InsertMany,
                vec![Value::String(collection.to_string()), Value::Array(documents)],
            )
            .await?;
        inserted_ids(&result)
    }

    /// Returns the number of documents written.
    pub async fn update_one(&self, collection: &str, filter: Value, update: Value) -> Result<u64> {
        let result = self
            .call(
                ProxyMethod::UpdateOne,
                vec![Value::String(collection.to_string()), filter, update],
            )
            .await?;
        Ok(written(&result))
    }

    pub async fn update_many(&self, collection: &str, filter: Value, update: Value) -> Result<u64> {
        let result = self
            .call(
                ProxyMethod::UpdateMany,
                vec![Value::String(collection.to_string()), filter, update],
            )
            .await?;
        Ok(written(&result))
    }

    pub async fn remove(&self, collection: &str, filter: Value) -> Result<u64> {
        let result = self
            .call(
                ProxyMethod::Remove,
                vec![Value::String(collection.to_string()), filter],
            )
            .await?;
        Ok(written(&result))
    }

    pub async fn find_one(&self, collection: &str, filter: Value) -> Result<Option<Document>> {
        let result = self
            .call(
                ProxyMethod::FindOne,
                vec![Value::String(collection.to_string()), filter],
            )
            .await?;
        match result {
            Value::Null => Ok(None),
            other => Ok(Some(serde_json::from_value(other)?)),
        }
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> Result<Vec<Document>> {
        let result = self
            .call(
                ProxyMethod::Find,
                vec![
                    Value::String(collection.to_string()),
                    filter,
                    Value::Null,
                    serde_json::to_value(options)?,
                ],
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn count(&self, collection: &str, filter: Value) -> Result<u64> {
        let result = self
            .call(
                ProxyMethod::Count,
                vec![Value::String(collection.to_string()), filter],
            )
            .await?;
        result
            .as_u64()
            .ok_or_else(|| ClientError::Decode(format!("count returned {result}")))
    }

    // ---- mirrors ----

    /// Returns the live mirror of `name`, creating it on first access.
    ///
    /// A new mirror listens to the collection, attaches to the poll loop and
    /// seeds itself with the collection's current documents.
    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        if let Some(existing) = self.cached_collection(name) {
            return Ok(existing);
        }

        self.listen_collection(name).await?;
        let collection = Collection::attach(self, name);
        let documents = self
            .find(name, Value::Object(Document::new()), FindOptions::default())
            .await?;
        collection.seed(documents);

        let mut cache = lock(&self.inner.collections);
        if let Some(existing) = cache.get(name).and_then(Weak::upgrade) {
            return Ok(Collection::from_inner(existing));
        }
        cache.insert(name.to_string(), collection.downgrade());
        Ok(collection)
    }

    fn cached_collection(&self, name: &str) -> Option<Collection> {
        lock(&self.inner.collections)
            .get(name)
            .and_then(Weak::upgrade)
            .map(Collection::from_inner)
    }

    /// Returns the mirrored item `id` of `collection`, fetching it if the
    /// mirror has not seen it yet.
    pub async fn get_item(&self, collection: &str, id: &str) -> Result<Option<Item>> {
        let mirror = self.get_collection(collection).await?;
        if let Some(item) = mirror.find_item(id) {
            return Ok(Some(item));
        }
        Ok(self
            .find_one(collection, document::id_filter(id))
            .await?
            .and_then(|doc| mirror.adopt(doc)))
    }
}

async fn poll_loop(client: Weak<Inner>) {
    loop {
        // Only hold the client for one poll, so dropping every handle ends
        // the loop.
        let Some(inner) = client.upgrade() else { break };
        let client = Client { inner };
        if client.is_closed() || !client.has_callbacks() {
            break;
        }
        match client.poll().await {
            Ok(events) => client.trigger(&events),
            Err(
                e @ (ClientError::Closed
                | ClientError::TooManyConnections
                | ClientError::ConnectTimeout),
            ) => {
                tracing::warn!(error = %e, "poll loop stopped");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "long poll failed, retrying");
                tokio::time::sleep(client.inner.retry_delay).await;
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClientError::TooManyConnections);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}

fn inserted_ids(result: &Value) -> Result<Vec<ItemId>> {
    match result.get("insertedIds") {
        Some(ids) => Ok(serde_json::from_value(ids.clone())?),
        None => Ok(Vec::new()),
    }
}

fn written(result: &Value) -> u64 {
    result.get("n").and_then(Value::as_u64).unwrap_or(0)
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    base_url: Option<String>,
    prefix: String,
    connect_timeout: Option<Duration>,
    retry_delay: Duration,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            prefix: DEFAULT_URL_PREFIX.to_string(),
            connect_timeout: None,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Server root, e.g. `http://127.0.0.1:3000`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Route prefix the server was configured with.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Give up on admission after `timeout` instead of retrying forever.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Pause between failed admissions or polls.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Config("base_url is required".to_string()))?;
        let prefix = self.prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            format!("{}/", base_url.trim_end_matches('/'))
        } else {
            format!("{}/{prefix}/", base_url.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder().build()?;

        Ok(Client {
            inner: Arc::new(Inner {
                http,
                base,
                connect_timeout: self.connect_timeout,
                retry_delay: self.retry_delay,
                token: OnceCell::new(),
                closed: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                poller: Mutex::new(None),
                collections: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> Client {
        Client::builder()
            .base_url("http://127.0.0.1:9/")
            .build()
            .unwrap()
    }

    fn event(id: Option<&str>) -> DeliveredEvent {
        DeliveredEvent {
            listen: ListenDescriptor::collection("t"),
            args: vec![json!("insert")],
            id: id.map(str::to_string),
        }
    }

    #[test]
    fn base_url_joins_prefix() {
        let client = client();
        assert_eq!(client.url("ready"), "http://127.0.0.1:9/api/mm/ready");

        let custom = Client::builder()
            .base_url("http://h")
            .prefix("sync")
            .build()
            .unwrap();
        assert_eq!(custom.url("on"), "http://h/sync/on");
    }

    #[test]
    fn builder_requires_base_url() {
        assert!(matches!(
            Client::builder().build(),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn duplicates_are_dropped_per_callback() {
        let client = client();
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        let counter = first.clone();
        let a = client.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.trigger(&[event(Some("1")), event(Some("2"))]);

        let counter = second.clone();
        client.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.trigger(&[event(Some("2")), event(Some("3")), event(None)]);

        // The first callback already saw "2"; the second sees it fresh.
        assert_eq!(first.load(Ordering::SeqCst), 4);
        assert_eq!(second.load(Ordering::SeqCst), 3);

        assert!(client.off(a));
        assert!(!client.off(a));
    }

    #[test]
    fn recent_ids_stay_bounded() {
        let mut seen = RecentIds::with_capacity(3);
        for id in ["a", "b", "c", "d"] {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 3);
        // Recent ids are still suppressed, the evicted one is not.
        assert!(!seen.insert("d"));
        assert!(!seen.insert("b"));
        assert!(seen.insert("a"));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn callback_memory_is_capped() {
        let client = client();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        client.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let batch: Vec<DeliveredEvent> = (0..SEEN_CAPACITY + 10)
            .map(|n| event(Some(&n.to_string())))
            .collect();
        client.trigger(&batch);
        client.trigger(&batch[batch.len() - 5..]);

        assert_eq!(calls.load(Ordering::SeqCst), (SEEN_CAPACITY + 10) as u64);
        let callbacks = lock(&client.inner.callbacks);
        assert_eq!(lock(&callbacks[0].seen).len(), SEEN_CAPACITY);
    }

    #[tokio::test]
    async fn connect_timeout_is_cached() {
        let client = Client::builder()
            .base_url("http://127.0.0.1:9")
            .connect_timeout(Duration::from_millis(50))
            .retry_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        assert_eq!(client.ready().await, Err(ClientError::ConnectTimeout));
        assert_eq!(client.ready().await, Err(ClientError::ConnectTimeout));
    }
}
