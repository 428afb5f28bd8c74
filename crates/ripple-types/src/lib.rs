//! Shared types for the ripple sync layer.
//!
//! This crate holds everything both ends of the wire agree on: the request
//! and response bodies of the HTTP protocol, the mutation events published by
//! the server, the listen descriptors that route them, and the document query
//! engine used by the storage adapters and by the client-side mirror.

pub mod call;
pub mod document;
pub mod event;

pub use call::{AccessMode, CallError, ProxyCall, ProxyMethod};
pub use document::{Document, FindOptions, ItemId, QueryError, ID_FIELD};
pub use event::{DeliveredEvent, EventInfo, EventKind, ListenDescriptor, MutationEvent};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default route prefix for the sync API.
pub const DEFAULT_URL_PREFIX: &str = "/api/mm/";

/// Outcome of a storage write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    /// `1` on success.
    pub ok: u8,
    /// Number of documents written or removed.
    pub n: u64,
    /// Identities assigned to inserted documents, in input order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inserted_ids: Vec<ItemId>,
    /// The inserted documents as stored, identities included.
    #[serde(skip)]
    pub documents: Vec<Document>,
}

/// `{"status": "success"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// Body of a successful `ready` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    pub token: String,
}

/// Query string of `quit` and `on`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: String,
}

/// Body of `listen` and `listen/stop`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub id: Option<ItemId>,
    #[serde(default)]
    pub filter: Option<String>,
}

/// Body of `emit` and `data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// Body returned by `emit` and `data`, on success or failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body returned by the long poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<DeliveredEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_result_wire_shape() {
        let result = WriteResult {
            ok: 1,
            n: 1,
            inserted_ids: vec!["a".to_string()],
            documents: vec![Document::new()],
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"ok": 1, "n": 1, "insertedIds": ["a"]})
        );
    }

    #[test]
    fn proxy_response_omits_absent_fields() {
        let response = ProxyResponse {
            result: json!(3),
            args: json!(["t", {}]),
            method: "count".to_string(),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"result": 3, "args": ["t", {}], "method": "count"})
        );
    }
}
