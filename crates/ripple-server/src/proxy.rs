//! Mutation proxy: storage calls that publish typed events.
//!
//! Writes go to the adapter first. Only once the adapter succeeded does the
//! proxy publish on the event channel; a failed write is published on the
//! matching error topics instead and logged. Update and remove calls read
//! the affected identities before writing, since the filter alone does not
//! name a stable set of documents afterwards.

use std::sync::Arc;

use ripple_bus::{EventBus, Subscription, Topic};
use ripple_store::{StorageAdapter, StoreError};
use ripple_types::document::Document;
use ripple_types::{
    EventInfo, EventKind, FindOptions, ItemId, MutationEvent, ProxyCall, ProxyMethod, WriteResult,
};
use serde_json::Value;
use thiserror::Error;

pub type MutationBus = EventBus<Topic, MutationEvent>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// `updateOne` matched nothing. Rendered as `["<collection>",<filter>] not found`.
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The topics a mutation is published on: one collection-level event plus
/// one item-level event per affected identity.
struct Publication {
    kind: EventKind,
    event: MutationEvent,
    items: Vec<ItemId>,
}

#[derive(Clone)]
pub struct MutationProxy {
    adapter: Arc<dyn StorageAdapter>,
    bus: MutationBus,
}

impl MutationProxy {
    pub fn new(adapter: Arc<dyn StorageAdapter>, bus: MutationBus) -> Self {
        Self { adapter, bus }
    }

    pub fn bus(&self) -> &MutationBus {
        &self.bus
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Subscribes to the failures of every mutation kind on `collection`.
    pub fn subscribe_errors(&self, collection: &str) -> Subscription<Topic, MutationEvent> {
        self.bus.subscribe(
            Topic::collection_touched(collection)
                .into_iter()
                .map(Topic::errors),
        )
    }

    /// Runs a decoded call and returns its JSON result.
    pub async fn execute(&self, call: ProxyCall) -> Result<Value, ProxyError> {
        match call {
            ProxyCall::InsertOne {
                collection,
                document,
                options,
            } => encode(self.insert_one(&collection, document, options).await?),
            ProxyCall::InsertMany {
                collection,
                documents,
                options,
            } => encode(self.insert_many(&collection, documents, options).await?),
            ProxyCall::UpdateOne {
                collection,
                filter,
                update,
                options,
            } => encode(self.update_one(&collection, filter, update, options).await?),
            ProxyCall::UpdateMany {
                collection,
                filter,
                update,
                options,
            } => encode(self.update_many(&collection, filter, update, options).await?),
            ProxyCall::Remove {
                collection,
                filter,
                options,
            } => encode(self.remove(&collection, filter, options).await?),
            ProxyCall::FindOne {
                collection,
                filter,
                projection,
            } => {
                let found = self
                    .adapter
                    .find_one(&collection, &filter, projection.as_ref())
                    .await?;
                Ok(found.map(Value::Object).unwrap_or(Value::Null))
            }
            ProxyCall::Find {
                collection,
                filter,
                projection,
                options,
            } => {
                let docs = self
                    .adapter
                    .find(&collection, &filter, projection.as_ref(), &options)
                    .await?;
                Ok(Value::Array(docs.into_iter().map(Value::Object).collect()))
            }
            ProxyCall::Count { collection, filter } => {
                Ok(Value::from(self.adapter.count(&collection, &filter).await?))
            }
        }
    }

    pub async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: Option<Value>,
    ) -> Result<WriteResult, ProxyError> {
        let submitted = document.clone();
        let outcome = self
            .adapter
            .insert_one(collection, document, options.as_ref())
            .await;
        let info = |result: Option<&WriteResult>| EventInfo {
            item: Some(
                result
                    .and_then(|r| r.documents.first().cloned())
                    .unwrap_or_else(|| submitted.clone()),
            ),
            options: options.clone(),
            ..EventInfo::default()
        };
        self.finish(collection, ProxyMethod::InsertOne, EventKind::Insert, Vec::new(), info, outcome)
    }

    pub async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: Option<Value>,
    ) -> Result<WriteResult, ProxyError> {
        let submitted = documents.clone();
        let outcome = self
            .adapter
            .insert_many(collection, documents, options.as_ref())
            .await;
        let info = |result: Option<&WriteResult>| EventInfo {
            items: Some(
                result
                    .map(|r| r.documents.clone())
                    .unwrap_or_else(|| submitted.clone()),
            ),
            ids: result.map(|r| r.inserted_ids.clone()),
            options: options.clone(),
            ..EventInfo::default()
        };
        self.finish(collection, ProxyMethod::InsertMany, EventKind::Insert, Vec::new(), info, outcome)
    }

    pub async fn update_one(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
        options: Option<Value>,
    ) -> Result<WriteResult, ProxyError> {
        let Some(item) = self.adapter.find_one(collection, &filter, None).await? else {
            let target = serde_json::to_string(&[Value::String(collection.to_string()), filter])?;
            return Err(ProxyError::NotFound(target));
        };
        let id = self.adapter.item_id(&item);
        // Pin the write to the document that was read.
        let target = match &id {
            Some(id) => self.adapter.filter_from_item_id(id),
            None => filter.clone(),
        };
        let outcome = self
            .adapter
            .update_one(collection, &target, &update, options.as_ref())
            .await;
        // The document went away between the read and the write.
        if matches!(&outcome, Ok(result) if result.n == 0) {
            let target = serde_json::to_string(&[Value::String(collection.to_string()), filter])?;
            return Err(ProxyError::NotFound(target));
        }
        let info = |_: Option<&WriteResult>| EventInfo {
            item: Some(item.clone()),
            id: id.clone(),
            filter: Some(filter.clone()),
            update: Some(update.clone()),
            options: options.clone(),
            ..EventInfo::default()
        };
        let items = id.clone().into_iter().collect();
        self.finish(collection, ProxyMethod::UpdateOne, EventKind::Update, items, info, outcome)
    }

    pub async fn update_many(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
        options: Option<Value>,
    ) -> Result<WriteResult, ProxyError> {
        let ids = self.matching_ids(collection, &filter).await?;
        let outcome = self
            .adapter
            .update_many(collection, &filter, &update, options.as_ref())
            .await;
        let info = |_: Option<&WriteResult>| EventInfo {
            ids: Some(ids.clone()),
            filter: Some(filter.clone()),
            update: Some(update.clone()),
            options: options.clone(),
            ..EventInfo::default()
        };
        self.finish(collection, ProxyMethod::UpdateMany, EventKind::Update, ids.clone(), info, outcome)
    }

    pub async fn remove(
        &self,
        collection: &str,
        filter: Value,
        options: Option<Value>,
    ) -> Result<WriteResult, ProxyError> {
        let ids = self.matching_ids(collection, &filter).await?;
        let outcome = self
            .adapter
            .remove(collection, &filter, options.as_ref())
            .await;
        let info = |_: Option<&WriteResult>| EventInfo {
            ids: Some(ids.clone()),
            filter: Some(filter.clone()),
            options: options.clone(),
            ..EventInfo::default()
        };
        self.finish(collection, ProxyMethod::Remove, EventKind::Remove, ids.clone(), info, outcome)
    }

    async fn matching_ids(&self, collection: &str, filter: &Value) -> Result<Vec<ItemId>, ProxyError> {
        let docs = self
            .adapter
            .find(collection, filter, None, &FindOptions::default())
            .await?;
        Ok(docs.iter().filter_map(|doc| self.adapter.item_id(doc)).collect())
    }

    /// Publishes the outcome of an adapter write and hands it back.
    fn finish(
        &self,
        collection: &str,
        method: ProxyMethod,
        kind: EventKind,
        items: Vec<ItemId>,
        info: impl Fn(Option<&WriteResult>) -> EventInfo,
        outcome: Result<WriteResult, StoreError>,
    ) -> Result<WriteResult, ProxyError> {
        match outcome {
            Ok(result) => {
                let event = MutationEvent {
                    kind,
                    collection: collection.to_string(),
                    method,
                    info: info(Some(&result)),
                    result: serde_json::to_value(&result)?,
                };
                self.publish(Publication { kind, event, items }, false);
                Ok(result)
            }
            Err(err) => {
                let event = MutationEvent {
                    kind,
                    collection: collection.to_string(),
                    method,
                    info: info(None),
                    result: Value::String(err.to_string()),
                };
                self.publish(Publication { kind, event, items }, true);
                Err(err.into())
            }
        }
    }

    fn publish(&self, publication: Publication, failed: bool) {
        let Publication { kind, event, items } = publication;
        let route = |topic: Topic| if failed { topic.errors() } else { topic };

        let collection_topic = route(Topic::collection(kind, event.collection.as_str()));
        if failed {
            tracing::warn!(
                topic = %collection_topic,
                method = %event.method,
                error = %event.result,
                "mutation failed"
            );
        }
        let delivered = self.bus.publish(&collection_topic, event.clone());
        tracing::debug!(topic = %collection_topic, delivered, "published mutation");

        for id in &items {
            let topic = route(Topic::item(kind, event.collection.as_str(), id.as_str()));
            self.bus.publish(&topic, event.for_item(id));
        }
    }
}

fn encode(result: WriteResult) -> Result<Value, ProxyError> {
    Ok(serde_json::to_value(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_store::MemoryAdapter;
    use serde_json::json;

    async fn proxy() -> MutationProxy {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
        adapter.start().await.unwrap();
        MutationProxy::new(adapter, EventBus::new("mutations", 1_000))
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[tokio::test]
    async fn insert_publishes_collection_event_with_ids() {
        let proxy = proxy().await;
        let mut sub = proxy.bus().subscribe(Topic::collection_touched("t"));

        let result = proxy
            .insert_one("t", doc(json!({"tag": "tr"})), None)
            .await
            .unwrap();
        let event = sub.try_recv().expect("insert event");
        assert_eq!(event.kind, EventKind::Insert);
        assert_eq!(event.method, ProxyMethod::InsertOne);
        let inserted = event.info.inserted();
        assert_eq!(inserted[0]["tag"], json!("tr"));
        assert_eq!(event.info.affected_ids(), result.inserted_ids);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn update_one_publishes_collection_and_item_events() {
        let proxy = proxy().await;
        proxy
            .insert_one("t", doc(json!({"_id": "a", "n": 1})), None)
            .await
            .unwrap();
        let mut collection = proxy.bus().subscribe(Topic::collection_touched("t"));
        let mut item = proxy.bus().subscribe(Topic::item_touched("t", "a"));

        proxy
            .update_one("t", json!({"n": 1}), json!({"$set": {"n": 2}}), None)
            .await
            .unwrap();

        let event = collection.try_recv().expect("collection event");
        assert_eq!(event.info.id.as_deref(), Some("a"));
        assert_eq!(event.info.item.as_ref().unwrap()["n"], json!(1));
        let event = item.try_recv().expect("item event");
        assert_eq!(event.kind, EventKind::Update);
    }

    #[tokio::test]
    async fn update_miss_names_target_and_publishes_nothing() {
        let proxy = proxy().await;
        let mut sub = proxy.bus().subscribe(Topic::collection_touched("t"));
        let mut errors = proxy.subscribe_errors("t");

        let err = proxy
            .update_one("t", json!({"n": 9}), json!({"$set": {"n": 2}}), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), r#"["t",{"n":9}] not found"#);
        assert!(sub.try_recv().is_none());
        assert!(errors.try_recv().is_none());
    }

    /// Deletes the target document right before delegating the write.
    struct VanishingAdapter(MemoryAdapter);

    #[async_trait::async_trait]
    impl StorageAdapter for VanishingAdapter {
        fn name(&self) -> &'static str {
            "vanishing"
        }

        async fn start(&self) -> Result<(), StoreError> {
            self.0.start().await
        }

        async fn stop(&self) -> Result<(), StoreError> {
            self.0.stop().await
        }

        async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
            self.0.count(collection, filter).await
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Value,
            projection: Option<&Value>,
            options: &FindOptions,
        ) -> Result<Vec<Document>, StoreError> {
            self.0.find(collection, filter, projection, options).await
        }

        async fn insert_many(
            &self,
            collection: &str,
            documents: Vec<Document>,
            options: Option<&Value>,
        ) -> Result<WriteResult, StoreError> {
            self.0.insert_many(collection, documents, options).await
        }

        async fn update_one(
            &self,
            collection: &str,
            filter: &Value,
            update: &Value,
            options: Option<&Value>,
        ) -> Result<WriteResult, StoreError> {
            self.0.remove(collection, filter, None).await?;
            self.0.update_one(collection, filter, update, options).await
        }

        async fn update_many(
            &self,
            collection: &str,
            filter: &Value,
            update: &Value,
            options: Option<&Value>,
        ) -> Result<WriteResult, StoreError> {
            self.0.update_many(collection, filter, update, options).await
        }

        async fn remove(
            &self,
            collection: &str,
            filter: &Value,
            options: Option<&Value>,
        ) -> Result<WriteResult, StoreError> {
            self.0.remove(collection, filter, options).await
        }
    }

    #[tokio::test]
    async fn update_of_vanished_document_is_not_found() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(VanishingAdapter(MemoryAdapter::new()));
        adapter.start().await.unwrap();
        let proxy = MutationProxy::new(adapter, EventBus::new("mutations", 1_000));
        proxy
            .insert_one("t", doc(json!({"_id": "a", "n": 1})), None)
            .await
            .unwrap();
        let mut collection = proxy.bus().subscribe(Topic::collection_touched("t"));
        let mut item = proxy.bus().subscribe(Topic::item_touched("t", "a"));

        let err = proxy
            .update_one("t", json!({"n": 1}), json!({"$set": {"n": 2}}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
        assert_eq!(err.to_string(), r#"["t",{"n":1}] not found"#);
        assert!(collection.try_recv().is_none());
        assert!(item.try_recv().is_none());
    }

    #[tokio::test]
    async fn remove_fans_out_per_item() {
        let proxy = proxy().await;
        proxy
            .insert_many(
                "t",
                vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))],
                None,
            )
            .await
            .unwrap();
        let mut collection = proxy.bus().subscribe(Topic::collection_touched("t"));
        let mut a = proxy.bus().subscribe(Topic::item_touched("t", "a"));
        let mut b = proxy.bus().subscribe(Topic::item_touched("t", "b"));

        let result = proxy.remove("t", json!({}), None).await.unwrap();
        assert_eq!(result.n, 2);

        let event = collection.try_recv().unwrap();
        assert_eq!(event.info.affected_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.try_recv().unwrap().info.id.as_deref(), Some("a"));
        assert_eq!(b.try_recv().unwrap().info.id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn adapter_failure_goes_to_error_topics_only() {
        let proxy = proxy().await;
        proxy
            .insert_one("t", doc(json!({"_id": "a"})), None)
            .await
            .unwrap();
        let mut events = proxy.bus().subscribe(Topic::collection_touched("t"));
        let mut errors = proxy.subscribe_errors("t");

        let err = proxy
            .insert_one("t", doc(json!({"_id": "a"})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Store(StoreError::DuplicateId { .. })));
        assert!(events.try_recv().is_none());
        let failure = errors.try_recv().expect("error event");
        assert_eq!(failure.kind, EventKind::Insert);
        assert!(failure.result.as_str().unwrap().contains("duplicate id"));
    }

    #[tokio::test]
    async fn reads_pass_through() {
        let proxy = proxy().await;
        proxy
            .insert_many(
                "t",
                vec![doc(json!({"_id": "a", "n": 1})), doc(json!({"_id": "b", "n": 2}))],
                None,
            )
            .await
            .unwrap();
        let count = proxy
            .execute(ProxyCall::Count {
                collection: "t".to_string(),
                filter: json!({"n": {"$gt": 1}}),
            })
            .await
            .unwrap();
        assert_eq!(count, json!(1));
        let missing = proxy
            .execute(ProxyCall::FindOne {
                collection: "t".to_string(),
                filter: json!({"n": 7}),
                projection: None,
            })
            .await
            .unwrap();
        assert_eq!(missing, Value::Null);
    }
}
