//! Volatile in-process backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use ripple_types::document::{self, Document, FindOptions};
use ripple_types::WriteResult;
use serde_json::Value;

use crate::adapter::{assign_id, check_collection, select, written, StorageAdapter};
use crate::error::StoreError;

type Collections = HashMap<String, Vec<Document>>;

/// Keeps every collection in memory, in insertion order.
///
/// Data does not survive `stop()`.
#[derive(Default)]
pub struct MemoryAdapter {
    collections: RwLock<Collections>,
    started: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_started(&self) -> Result<(), StoreError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotStarted)
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        limit: Option<usize>,
    ) -> Result<WriteResult, StoreError> {
        self.ensure_started()?;
        check_collection(collection)?;
        let mut collections = self.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(written(0));
        };

        // Compute every replacement first so a failing update leaves the
        // collection untouched.
        let mut replacements = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            if limit.is_some_and(|limit| replacements.len() >= limit) {
                break;
            }
            if document::matches(doc, filter)? {
                replacements.push((index, document::apply_update(doc, update)?));
            }
        }

        let n = replacements.len();
        for (index, doc) in replacements {
            docs[index] = doc;
        }
        Ok(written(n))
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self) -> Result<(), StoreError> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        self.started.store(false, Ordering::Release);
        self.write().clear();
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        self.ensure_started()?;
        check_collection(collection)?;
        let collections = self.read();
        let mut n = 0;
        for doc in collections.get(collection).into_iter().flatten() {
            if document::matches(doc, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.ensure_started()?;
        check_collection(collection)?;
        let docs = self.read().get(collection).cloned().unwrap_or_default();
        select(docs, filter, projection, options)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        self.ensure_started()?;
        check_collection(collection)?;
        let mut collections = self.write();
        let docs = collections.entry(collection.to_string()).or_default();

        let mut staged = Vec::with_capacity(documents.len());
        let mut ids = Vec::with_capacity(documents.len());
        for mut doc in documents {
            let id = assign_id(&mut doc);
            let taken = ids.contains(&id)
                || docs
                    .iter()
                    .any(|existing| document::item_id(existing).as_deref() == Some(id.as_str()));
            if taken {
                return Err(StoreError::DuplicateId {
                    collection: collection.to_string(),
                    id,
                });
            }
            ids.push(id);
            staged.push(doc);
        }

        docs.extend(staged.iter().cloned());
        let ids_len = ids.len();
        Ok(WriteResult {
            inserted_ids: ids,
            documents: staged,
            ..written(ids_len)
        })
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        self.update(collection, filter, update, Some(1))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        self.update(collection, filter, update, None)
    }

    async fn remove(
        &self,
        collection: &str,
        filter: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        self.ensure_started()?;
        check_collection(collection)?;
        let mut collections = self.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(written(0));
        };

        let mut keep = Vec::with_capacity(docs.len());
        for doc in docs.iter() {
            keep.push(!document::matches(doc, filter)?);
        }
        let before = docs.len();
        let mut flags = keep.into_iter();
        docs.retain(|_| flags.next().unwrap_or(true));
        Ok(written(before - docs.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    async fn started() -> MemoryAdapter {
        let adapter = MemoryAdapter::new();
        adapter.start().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn operations_fail_before_start() {
        let adapter = MemoryAdapter::new();
        let err = adapter.count("t", &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotStarted));
    }

    #[tokio::test]
    async fn insert_assigns_missing_ids() {
        let adapter = started().await;
        let result = adapter
            .insert_one("t", doc(json!({"name": "a"})), None)
            .await
            .unwrap();
        assert_eq!(result.n, 1);
        assert_eq!(result.inserted_ids.len(), 1);
        let stored = adapter
            .find_one("t", &json!({"name": "a"}), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document::item_id(&stored), Some(result.inserted_ids[0].clone()));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_atomically() {
        let adapter = started().await;
        adapter
            .insert_one("t", doc(json!({"_id": "a"})), None)
            .await
            .unwrap();
        let err = adapter
            .insert_many(
                "t",
                vec![doc(json!({"_id": "b"})), doc(json!({"_id": "a"}))],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));
        assert_eq!(adapter.count("t", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_one_touches_first_match_only() {
        let adapter = started().await;
        adapter
            .insert_many(
                "t",
                vec![
                    doc(json!({"_id": "a", "n": 1})),
                    doc(json!({"_id": "b", "n": 1})),
                ],
                None,
            )
            .await
            .unwrap();
        let result = adapter
            .update_one("t", &json!({"n": 1}), &json!({"$set": {"n": 2}}), None)
            .await
            .unwrap();
        assert_eq!(result.n, 1);
        assert_eq!(adapter.count("t", &json!({"n": 2})).await.unwrap(), 1);

        let result = adapter
            .update_many("t", &json!({}), &json!({"$inc": {"n": 10}}), None)
            .await
            .unwrap();
        assert_eq!(result.n, 2);
        assert_eq!(adapter.count("t", &json!({"n": {"$gt": 10}})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_and_find_options() {
        let adapter = started().await;
        for (id, n) in [("a", 3), ("b", 1), ("c", 2)] {
            adapter
                .insert_one("t", doc(json!({"_id": id, "n": n})), None)
                .await
                .unwrap();
        }
        let options = FindOptions {
            sort: Some(json!({"n": 1})),
            limit: Some(2),
            ..FindOptions::default()
        };
        let found = adapter
            .find("t", &json!({}), Some(&json!({"n": 1})), &options)
            .await
            .unwrap();
        let ns: Vec<_> = found.iter().map(|d| d["n"].clone()).collect();
        assert_eq!(ns, vec![json!(1), json!(2)]);

        let removed = adapter.remove("t", &json!({"n": {"$gte": 2}}), None).await.unwrap();
        assert_eq!(removed.n, 2);
        assert_eq!(adapter.count("t", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_collection_name_is_rejected() {
        let adapter = started().await;
        let err = adapter.count("", &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCollection));
    }
}
