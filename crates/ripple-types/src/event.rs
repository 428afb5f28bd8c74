//! Mutation events and the listen/delivery envelope that carries them to
//! clients.

use crate::call::ProxyMethod;
use crate::document::{Document, ItemId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The three kinds of document change the sync layer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Remove,
}

impl EventKind {
    /// Returns the wire label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Describes what a mutation touched.
///
/// Collection-level events carry `ids` (or `id` for `updateOne`); item-level
/// events always carry the single `id` they were published for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    /// The inserted document (`insertOne`) or the pre-image (`updateOne`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Document>,
    /// The inserted documents (`insertMany`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Document>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<ItemId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl EventInfo {
    /// Identities affected by the event, whichever field carries them.
    pub fn affected_ids(&self) -> Vec<ItemId> {
        if let Some(ids) = &self.ids {
            return ids.clone();
        }
        if let Some(id) = &self.id {
            return vec![id.clone()];
        }
        let inserted = self.item.iter().chain(self.items.iter().flatten());
        inserted.filter_map(crate::document::item_id).collect()
    }

    /// Documents carried by an insert event.
    pub fn inserted(&self) -> Vec<Document> {
        self.item
            .iter()
            .cloned()
            .chain(self.items.iter().flatten().cloned())
            .collect()
    }
}

/// A change published by the mutation proxy once the adapter succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub kind: EventKind,
    pub collection: String,
    pub method: ProxyMethod,
    pub info: EventInfo,
    /// The serialized adapter result, or the error message on error topics.
    pub result: Value,
}

impl MutationEvent {
    /// Copy of this event scoped to a single item.
    pub fn for_item(&self, id: &ItemId) -> Self {
        let mut event = self.clone();
        event.info.id = Some(id.clone());
        event.info.ids = None;
        event
    }

    /// Encodes the event as the positional argument list delivered to
    /// listeners: `[kind, info, method, result]`.
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::String(self.kind.as_str().to_string()),
            serde_json::to_value(&self.info).unwrap_or(Value::Null),
            Value::String(self.method.as_str().to_string()),
            self.result.clone(),
        ]
    }

    /// Decodes an argument list produced by [`MutationEvent::to_args`].
    ///
    /// Returns `None` when the arguments were reshaped (for example by a
    /// server-side filter) into something that is no longer a mutation.
    pub fn from_args(collection: &str, args: &[Value]) -> Option<Self> {
        let kind = args.first()?.as_str()?.parse().ok()?;
        let info = serde_json::from_value(args.get(1)?.clone()).ok()?;
        let method = args
            .get(2)
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())?;
        Some(Self {
            kind,
            collection: collection.to_string(),
            method,
            info,
            result: args.get(3).cloned().unwrap_or(Value::Null),
        })
    }
}

/// The (collection, item, filter) triple a listen registration was made
/// with. Every delivered event is tagged with the descriptor that routed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenDescriptor {
    pub collection: String,
    #[serde(default)]
    pub id: Option<ItemId>,
    #[serde(default)]
    pub filter: Option<String>,
}

impl ListenDescriptor {
    /// Creates a descriptor, treating empty strings as absent.
    pub fn new(
        collection: impl Into<String>,
        id: Option<impl Into<String>>,
        filter: Option<impl Into<String>>,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.map(Into::into).filter(|s: &String| !s.is_empty()),
            filter: filter.map(Into::into).filter(|s: &String| !s.is_empty()),
        }
    }

    /// Descriptor for a plain collection registration.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            filter: None,
        }
    }
}

/// One event as returned by the long poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredEvent {
    pub listen: ListenDescriptor,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Generated relay id, used by clients to drop duplicate deliveries.
    #[serde(default)]
    pub id: Option<String>,
}

impl DeliveredEvent {
    /// Decodes the carried mutation, if the arguments still describe one.
    pub fn mutation(&self) -> Option<MutationEvent> {
        MutationEvent::from_args(&self.listen.collection, &self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutation_args_round_trip_through_delivery() {
        let event = MutationEvent {
            kind: EventKind::Update,
            collection: "table".to_string(),
            method: ProxyMethod::UpdateMany,
            info: EventInfo {
                ids: Some(vec!["a".to_string(), "b".to_string()]),
                update: Some(json!({"$set": {"x": 1}})),
                ..EventInfo::default()
            },
            result: json!({"ok": 1, "n": 2}),
        };
        let delivered = DeliveredEvent {
            listen: ListenDescriptor::collection("table"),
            args: event.to_args(),
            id: Some("e1".to_string()),
        };
        assert_eq!(delivered.args[0], json!("update"));
        assert_eq!(delivered.mutation(), Some(event.clone()));

        let item = event.for_item(&"a".to_string());
        assert_eq!(item.info.affected_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn reshaped_args_are_not_a_mutation() {
        let delivered = DeliveredEvent {
            listen: ListenDescriptor::new("t", None::<String>, Some("f")),
            args: vec![json!(42)],
            id: None,
        };
        assert_eq!(delivered.mutation(), None);
    }

    #[test]
    fn descriptor_serializes_absent_fields_as_null() {
        let descriptor = ListenDescriptor::new("t", Some(""), None::<String>);
        assert_eq!(
            serde_json::to_value(&descriptor).unwrap(),
            json!({"collection": "t", "id": null, "filter": null})
        );
    }

    #[test]
    fn inserted_ids_come_from_documents() {
        let info = EventInfo {
            items: Some(vec![
                json!({"_id": "a"}).as_object().unwrap().clone(),
                json!({"_id": "b"}).as_object().unwrap().clone(),
            ]),
            ..EventInfo::default()
        };
        assert_eq!(info.affected_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(info.inserted().len(), 2);
    }
}
