//! Session token admission, validation, and invalidation.
//!
//! Tokens live in the `<prefix>tokens` collection of the configured adapter,
//! one document per session: `{token, ip, createdAt, updatedAt}` with
//! millisecond timestamps. A token is valid while its record exists and was
//! touched within twice the idle timeout.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use ripple_store::{StorageAdapter, StoreError};
use ripple_types::{Document, FindOptions};
use serde_json::{json, Value};
use thiserror::Error;

pub const TOKEN_LENGTH: usize = 24;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Too many connections")]
    TooManyConnections,

    #[error("Invalid token {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct TokenManager {
    adapter: Arc<dyn StorageAdapter>,
    tokens: String,
    events: String,
    idle_timeout: Duration,
    max_per_origin: u64,
}

impl TokenManager {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        tokens_collection: String,
        events_collection: String,
        idle_timeout: Duration,
        max_per_origin: u64,
    ) -> Self {
        Self {
            adapter,
            tokens: tokens_collection,
            events: events_collection,
            idle_timeout,
            max_per_origin,
        }
    }

    /// Oldest `updatedAt` still considered alive.
    fn cutoff(&self) -> i64 {
        now_ms() - 2 * self.idle_timeout.as_millis() as i64
    }

    /// Removes stale tokens and queued events left behind by dead sessions.
    pub async fn purge_stale(&self) -> Result<u64, TokenError> {
        let cutoff = self.cutoff();
        let tokens = self
            .adapter
            .remove(&self.tokens, &json!({"updatedAt": {"$lt": cutoff}}), None)
            .await?;
        let events = self
            .adapter
            .remove(&self.events, &json!({"createdAt": {"$lt": cutoff}}), None)
            .await?;
        if tokens.n > 0 || events.n > 0 {
            tracing::debug!(tokens = tokens.n, events = events.n, "purged stale sessions");
        }
        Ok(tokens.n)
    }

    /// Issues a new token for `origin`, unless the origin already holds the
    /// maximum number of live tokens.
    ///
    /// The cap is best effort: concurrent admissions from one origin may
    /// overshoot it slightly.
    pub async fn admit(&self, origin: &str) -> Result<String, TokenError> {
        self.purge_stale().await?;

        let live = self.adapter.count(&self.tokens, &json!({"ip": origin})).await?;
        if live >= self.max_per_origin {
            tracing::warn!(origin, live, "admission refused, too many connections");
            return Err(TokenError::TooManyConnections);
        }

        let token = generate_token();
        let now = now_ms();
        let mut record = Document::new();
        record.insert("token".to_string(), Value::String(token.clone()));
        record.insert("ip".to_string(), Value::String(origin.to_string()));
        record.insert("createdAt".to_string(), json!(now));
        record.insert("updatedAt".to_string(), json!(now));
        self.adapter.insert_one(&self.tokens, record, None).await?;

        tracing::debug!(origin, "admitted session");
        Ok(token)
    }

    pub async fn is_valid(&self, token: &str) -> Result<bool, TokenError> {
        if token.is_empty() {
            return Ok(false);
        }
        let filter = json!({"token": token, "updatedAt": {"$gte": self.cutoff()}});
        Ok(self.adapter.count(&self.tokens, &filter).await? > 0)
    }

    /// Fails with [`TokenError::Invalid`] unless `token` is valid.
    pub async fn require(&self, token: &str) -> Result<(), TokenError> {
        if self.is_valid(token).await? {
            Ok(())
        } else {
            Err(TokenError::Invalid(token.to_string()))
        }
    }

    /// Marks `token` as recently used.
    pub async fn touch(&self, token: &str) -> Result<(), TokenError> {
        self.adapter
            .update_many(
                &self.tokens,
                &json!({"token": token}),
                &json!({"$set": {"updatedAt": now_ms()}}),
                None,
            )
            .await?;
        Ok(())
    }

    /// Deletes every token record matching `filter` and returns how many
    /// went away.
    pub async fn invalidate(&self, filter: &Value) -> Result<u64, TokenError> {
        let removed = self.adapter.remove(&self.tokens, filter, None).await?;
        tracing::info!(count = removed.n, "invalidated tokens");
        Ok(removed.n)
    }

    /// Live token values issued to `origin`.
    pub async fn tokens_for(&self, origin: &str) -> Result<Vec<String>, TokenError> {
        let docs = self
            .adapter
            .find(
                &self.tokens,
                &json!({"ip": origin}),
                None,
                &FindOptions::default(),
            )
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| doc.get("token").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_store::MemoryAdapter;

    async fn manager(cap: u64) -> (TokenManager, Arc<dyn StorageAdapter>) {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
        adapter.start().await.unwrap();
        let manager = TokenManager::new(
            adapter.clone(),
            "rp_tokens".to_string(),
            "rp_events".to_string(),
            Duration::from_secs(120),
            cap,
        );
        (manager, adapter)
    }

    #[tokio::test]
    async fn admitted_tokens_are_valid_alphanumeric() {
        let (tokens, _) = manager(4).await;
        let token = tokens.admit("10.0.0.1").await.unwrap();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(tokens.is_valid(&token).await.unwrap());
        assert!(!tokens.is_valid("nope").await.unwrap());
        assert!(!tokens.is_valid("").await.unwrap());
    }

    #[tokio::test]
    async fn cap_is_per_origin() {
        let (tokens, _) = manager(2).await;
        tokens.admit("a").await.unwrap();
        tokens.admit("a").await.unwrap();
        assert!(matches!(
            tokens.admit("a").await,
            Err(TokenError::TooManyConnections)
        ));
        tokens.admit("b").await.unwrap();
        assert_eq!(tokens.tokens_for("a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_tokens_are_purged_on_admission() {
        let (tokens, adapter) = manager(1).await;
        let stale = now_ms() - 3 * 120_000;
        let record = json!({"token": "old", "ip": "a", "createdAt": stale, "updatedAt": stale});
        let Value::Object(record) = record else { unreachable!() };
        adapter.insert_one("rp_tokens", record, None).await.unwrap();

        assert!(!tokens.is_valid("old").await.unwrap());
        tokens.admit("a").await.unwrap();
        assert_eq!(adapter.count("rp_tokens", &json!({"token": "old"})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalidate_and_require() {
        let (tokens, _) = manager(4).await;
        let token = tokens.admit("a").await.unwrap();
        tokens.touch(&token).await.unwrap();
        tokens.require(&token).await.unwrap();

        assert_eq!(tokens.invalidate(&json!({})).await.unwrap(), 1);
        let err = tokens.require(&token).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Invalid token {token}"));
    }
}
