//! Durable backend on SQLite.
//!
//! Documents are stored as JSON bodies in a single `documents` table keyed
//! by `(collection, item_id)`. Filtering happens in Rust with the shared query
//! engine, except for exact identity lookups which go straight to the index.
//! All SQLite work runs on the blocking pool.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, IN_MEMORY};

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ripple_types::document::{self, Document, FindOptions, ID_FIELD};
use ripple_types::WriteResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::adapter::{assign_id, check_collection, select, written, StorageAdapter};
use crate::error::StoreError;

/// A stored row: insertion sequence and decoded body.
type Row = (i64, Document);

pub struct SqliteAdapter {
    path: String,
    settings: DbRuntimeSettings,
    pool: RwLock<Option<DbPool>>,
}

impl SqliteAdapter {
    /// Creates an adapter for the database at `path`. Nothing is opened
    /// until `start()`.
    pub fn new(path: impl Into<String>, settings: DbRuntimeSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            pool: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn pool(&self) -> Result<DbPool, StoreError> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotStarted)
    }

    /// Runs `f` with a pooled connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Returns the identity named by a filter of the exact form `{"_id": "x"}`.
fn exact_id(filter: &Value) -> Option<String> {
    let Value::Object(filter) = filter else {
        return None;
    };
    if filter.len() != 1 {
        return None;
    }
    match filter.get(ID_FIELD)? {
        Value::String(id) => Some(id.clone()),
        _ => None,
    }
}

fn decode(seq: i64, body: &str) -> Result<Row, StoreError> {
    match serde_json::from_str(body)? {
        Value::Object(doc) => Ok((seq, doc)),
        _ => Err(StoreError::Task(format!(
            "stored document {seq} is not an object"
        ))),
    }
}

/// Loads the candidate rows for `filter`, then keeps the matching ones.
fn load_matching(
    conn: &Connection,
    collection: &str,
    filter: &Value,
) -> Result<Vec<Row>, StoreError> {
    let mut rows = Vec::new();
    if let Some(id) = exact_id(filter) {
        let found: Option<(i64, String)> = conn
            .query_row(
                "SELECT seq, body FROM documents WHERE collection = ?1 AND item_id = ?2",
                params![collection, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((seq, body)) = found {
            rows.push(decode(seq, &body)?);
        }
        return Ok(rows);
    }

    let mut stmt = conn
        .prepare_cached("SELECT seq, body FROM documents WHERE collection = ?1 ORDER BY seq")?;
    let mut cursor = stmt.query(params![collection])?;
    while let Some(row) = cursor.next()? {
        let seq: i64 = row.get(0)?;
        let body: String = row.get(1)?;
        let (seq, doc) = decode(seq, &body)?;
        if document::matches(&doc, filter)? {
            rows.push((seq, doc));
        }
    }
    Ok(rows)
}

fn update_rows(
    conn: &mut Connection,
    collection: &str,
    filter: &Value,
    update: &Value,
    limit: Option<usize>,
) -> Result<WriteResult, StoreError> {
    let tx = conn.transaction()?;
    let mut rows = load_matching(&tx, collection, filter)?;
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    for (seq, doc) in &rows {
        let updated = document::apply_update(doc, update)?;
        tx.execute(
            "UPDATE documents SET body = ?1 WHERE seq = ?2",
            params![serde_json::to_string(&updated)?, seq],
        )?;
    }
    tx.commit()?;
    Ok(written(rows.len()))
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn start(&self) -> Result<(), StoreError> {
        if self.pool().is_ok() {
            return Ok(());
        }
        let path = self.path.clone();
        let settings = self.settings;
        let pool = tokio::task::spawn_blocking(move || -> Result<DbPool, StoreError> {
            let pool = create_pool(&path, settings)?;
            let conn = pool.get()?;
            let applied = run_migrations(&conn)?;
            tracing::info!(path = %path, applied, "sqlite storage ready");
            Ok(pool)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        self.pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        check_collection(collection)?;
        let collection = collection.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            if filter.as_object().is_some_and(|f| f.is_empty()) {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                    params![collection],
                    |row| row.get(0),
                )?;
                return Ok(n as u64);
            }
            Ok(load_matching(conn, &collection, &filter)?.len() as u64)
        })
        .await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        check_collection(collection)?;
        let collection = collection.to_string();
        let filter = filter.clone();
        let projection = projection.cloned();
        let options = options.clone();
        self.with_conn(move |conn| {
            let rows = load_matching(conn, &collection, &filter)?;
            select(
                rows.into_iter().map(|(_, doc)| doc),
                &Value::Object(Default::default()),
                projection.as_ref(),
                &options,
            )
        })
        .await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        check_collection(collection)?;
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut staged = Vec::with_capacity(documents.len());
            let mut ids = Vec::with_capacity(documents.len());
            for mut doc in documents {
                let id = assign_id(&mut doc);
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO documents (collection, item_id, body) VALUES (?1, ?2, ?3)",
                    params![collection, id, serde_json::to_string(&doc)?],
                )?;
                if inserted == 0 {
                    // Dropping the transaction rolls back the earlier rows.
                    return Err(StoreError::DuplicateId {
                        collection: collection.clone(),
                        id,
                    });
                }
                ids.push(id);
                staged.push(doc);
            }
            tx.commit()?;
            let n = ids.len();
            Ok(WriteResult {
                inserted_ids: ids,
                documents: staged,
                ..written(n)
            })
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        check_collection(collection)?;
        let (collection, filter, update) = (collection.to_string(), filter.clone(), update.clone());
        self.with_conn(move |conn| update_rows(conn, &collection, &filter, &update, Some(1)))
            .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        check_collection(collection)?;
        let (collection, filter, update) = (collection.to_string(), filter.clone(), update.clone());
        self.with_conn(move |conn| update_rows(conn, &collection, &filter, &update, None))
            .await
    }

    async fn remove(
        &self,
        collection: &str,
        filter: &Value,
        _options: Option<&Value>,
    ) -> Result<WriteResult, StoreError> {
        check_collection(collection)?;
        let (collection, filter) = (collection.to_string(), filter.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let rows = load_matching(&tx, &collection, &filter)?;
            for (seq, _) in &rows {
                tx.execute("DELETE FROM documents WHERE seq = ?1", params![seq])?;
            }
            tx.commit()?;
            Ok(written(rows.len()))
        })
        .await
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

    async fn started() -> SqliteAdapter {
        let adapter = SqliteAdapter::new(IN_MEMORY, DbRuntimeSettings::default());
        adapter.start().await.unwrap();
        adapter
    }

    #[test]
    fn exact_id_detection() {
        assert_eq!(exact_id(&json!({"_id": "a"})), Some("a".to_string()));
        assert_eq!(exact_id(&json!({"_id": "a", "n": 1})), None);
        assert_eq!(exact_id(&json!({"_id": {"$in": ["a"]}})), None);
    }

    #[tokio::test]
    async fn operations_fail_before_start() {
        let adapter = SqliteAdapter::new(IN_MEMORY, DbRuntimeSettings::default());
        let err = adapter.count("t", &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotStarted));
    }

    #[tokio::test]
    async fn crud_round() {
        let adapter = started().await;
        let inserted = adapter
            .insert_many(
                "t",
                vec![doc(json!({"_id": "a", "n": 1})), doc(json!({"n": 2}))],
                None,
            )
            .await
            .unwrap();
        assert_eq!(inserted.n, 2);
        assert_eq!(inserted.inserted_ids[0], "a");

        let updated = adapter
            .update_one("t", &json!({"_id": "a"}), &json!({"$set": {"n": 5}}), None)
            .await
            .unwrap();
        assert_eq!(updated.n, 1);
        let a = adapter
            .find_one("t", &json!({"_id": "a"}), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a["n"], json!(5));

        assert_eq!(adapter.count("t", &json!({"n": {"$gt": 1}})).await.unwrap(), 2);
        let removed = adapter.remove("t", &json!({"n": 5}), None).await.unwrap();
        assert_eq!(removed.n, 1);
        assert_eq!(adapter.count("t", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_rolls_back_batch() {
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
    async fn invalid_update_leaves_rows_untouched() {
        let adapter = started().await;
        adapter
            .insert_one("t", doc(json!({"_id": "a", "n": 1})), None)
            .await
            .unwrap();
        let err = adapter
            .update_many("t", &json!({}), &json!({"$set": {"_id": "b"}}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
        assert_eq!(adapter.count("t", &json!({"_id": "a"})).await.unwrap(), 1);
    }
}
