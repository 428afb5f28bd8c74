//! The storage adapter contract.

use async_trait::async_trait;
use ripple_types::document::{self, Document, FindOptions, ItemId};
use ripple_types::WriteResult;
use serde_json::Value;

use crate::error::StoreError;

/// Uniform CRUD access to a document backend.
///
/// Adapters are shared behind `Arc<dyn StorageAdapter>`; every call is a
/// suspension point and must not block the async runtime.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend label used in logs.
    fn name(&self) -> &'static str;

    /// Opens the backend. Must be called before any other operation.
    async fn start(&self) -> Result<(), StoreError>;

    /// Releases the backend. Idempotent.
    async fn stop(&self) -> Result<(), StoreError>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError>;

    /// Returns matching documents in insertion order unless `options.sort`
    /// says otherwise.
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
    ) -> Result<Option<Document>, StoreError> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let mut docs = self.find(collection, filter, projection, &options).await?;
        Ok(if docs.is_empty() {
            None
        } else {
            Some(docs.swap_remove(0))
        })
    }

    /// Inserts one document, assigning an identity if it has none.
    async fn insert_one(
        &self,
        collection: &str,
        document: Document,
        options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        self.insert_many(collection, vec![document], options).await
    }

    /// Inserts documents atomically, assigning identities where missing.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        options: Option<&Value>,
    ) -> Result<WriteResult, StoreError>;

    /// Updates the first matching document.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: Option<&Value>,
    ) -> Result<WriteResult, StoreError>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: Option<&Value>,
    ) -> Result<WriteResult, StoreError>;

    async fn remove(
        &self,
        collection: &str,
        filter: &Value,
        options: Option<&Value>,
    ) -> Result<WriteResult, StoreError>;

    fn item_id(&self, document: &Document) -> Option<ItemId> {
        document::item_id(document)
    }

    fn filter_from_item_id(&self, id: &str) -> Value {
        document::id_filter(id)
    }

    fn filter_from_item_ids(&self, ids: &[ItemId]) -> Value {
        document::ids_filter(ids)
    }
}

/// Rejects empty collection names.
pub(crate) fn check_collection(collection: &str) -> Result<(), StoreError> {
    if collection.is_empty() {
        return Err(StoreError::InvalidCollection);
    }
    Ok(())
}

/// Ensures `document` carries an identity and returns it.
pub(crate) fn assign_id(document: &mut Document) -> ItemId {
    if let Some(id) = document::item_id(document) {
        return id;
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    document.insert(document::ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

/// Filters, orders, and projects an already loaded collection.
pub(crate) fn select(
    docs: impl IntoIterator<Item = Document>,
    filter: &Value,
    projection: Option<&Value>,
    options: &FindOptions,
) -> Result<Vec<Document>, StoreError> {
    let mut matched = Vec::new();
    for doc in docs {
        if document::matches(&doc, filter)? {
            matched.push(doc);
        }
    }
    let ordered = document::apply_find_options(matched, options)?;
    match projection {
        Some(projection) => Ok(ordered
            .iter()
            .map(|doc| document::project(doc, projection))
            .collect::<Result<_, _>>()?),
        None => Ok(ordered),
    }
}

/// Successful write touching `n` documents.
pub(crate) fn written(n: usize) -> WriteResult {
    WriteResult {
        ok: 1,
        n: n as u64,
        ..WriteResult::default()
    }
}
