//! Structured topics for mutation events.

use ripple_types::{EventKind, ItemId};
use std::fmt;

/// Whether a topic carries successful mutations or adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Events,
    /// Failures, for internal observability only.
    Errors,
}

/// A mutation topic: `(channel, kind, collection, optional item)`.
///
/// Collection-scoped topics have no item; item-scoped topics name the single
/// document they concern. Inserts are only ever collection-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub channel: Channel,
    pub kind: EventKind,
    pub collection: String,
    pub item: Option<ItemId>,
}

impl Topic {
    /// Collection-scoped event topic.
    pub fn collection(kind: EventKind, collection: impl Into<String>) -> Self {
        Self {
            channel: Channel::Events,
            kind,
            collection: collection.into(),
            item: None,
        }
    }

    /// Item-scoped event topic.
    pub fn item(kind: EventKind, collection: impl Into<String>, id: impl Into<ItemId>) -> Self {
        Self {
            channel: Channel::Events,
            kind,
            collection: collection.into(),
            item: Some(id.into()),
        }
    }

    /// The error-channel counterpart of this topic.
    pub fn errors(mut self) -> Self {
        self.channel = Channel::Errors;
        self
    }

    /// Topics touched by any change to `collection`.
    pub fn collection_touched(collection: &str) -> Vec<Self> {
        [EventKind::Insert, EventKind::Update, EventKind::Remove]
            .into_iter()
            .map(|kind| Self::collection(kind, collection))
            .collect()
    }

    /// Topics touched by any change to one item of `collection`.
    pub fn item_touched(collection: &str, id: &str) -> Vec<Self> {
        [EventKind::Update, EventKind::Remove]
            .into_iter()
            .map(|kind| Self::item(kind, collection, id))
            .collect()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if self.channel == Channel::Errors {
            f.write_str("-error")?;
        }
        write!(f, ":{}", self.collection)?;
        if let Some(item) = &self.item {
            write!(f, ":{item}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_labels() {
        assert_eq!(Topic::collection(EventKind::Insert, "t").to_string(), "insert:t");
        assert_eq!(
            Topic::item(EventKind::Update, "t", "a").errors().to_string(),
            "update-error:t:a"
        );
    }

    #[test]
    fn touched_sets() {
        let collection = Topic::collection_touched("t");
        assert_eq!(collection.len(), 3);
        assert!(collection.iter().all(|t| t.item.is_none()));

        let item = Topic::item_touched("t", "a");
        assert_eq!(item.len(), 2);
        assert!(item.iter().all(|t| t.kind != EventKind::Insert));
    }

    #[test]
    fn error_topics_are_distinct() {
        let topic = Topic::collection(EventKind::Remove, "t");
        assert_ne!(topic.clone(), topic.errors());
    }
}
