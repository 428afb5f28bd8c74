//! Connector string to adapter resolution.

use std::sync::Arc;

use crate::adapter::StorageAdapter;
use crate::error::StoreError;
use crate::memory::MemoryAdapter;
use crate::sqlite::{DbRuntimeSettings, SqliteAdapter};

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;
type Factory = Box<dyn Fn(&str) -> Result<Arc<dyn StorageAdapter>, StoreError> + Send + Sync>;

/// Ordered list of `(matcher, factory)` pairs. The first matcher accepting a
/// connector wins, so later registrations cannot shadow earlier ones.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: Vec<(Matcher, Factory)>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `memory://` and `sqlite://<path>` backends.
    pub fn with_defaults(settings: DbRuntimeSettings) -> Self {
        let mut registry = Self::new();
        registry.register(
            |connector| connector.starts_with("memory://"),
            |_| Ok(Arc::new(MemoryAdapter::new()) as Arc<dyn StorageAdapter>),
        );
        registry.register(
            |connector| connector.starts_with("sqlite://"),
            move |connector| {
                let path = connector.trim_start_matches("sqlite://");
                if path.is_empty() {
                    return Err(StoreError::UnsupportedConnector(connector.to_string()));
                }
                Ok(Arc::new(SqliteAdapter::new(path, settings)) as Arc<dyn StorageAdapter>)
            },
        );
        registry
    }

    pub fn register<M, F>(&mut self, matcher: M, factory: F)
    where
        M: Fn(&str) -> bool + Send + Sync + 'static,
        F: Fn(&str) -> Result<Arc<dyn StorageAdapter>, StoreError> + Send + Sync + 'static,
    {
        self.entries.push((Box::new(matcher), Box::new(factory)));
    }

    /// Builds an adapter for `connector`. The adapter is not started.
    pub fn resolve(&self, connector: &str) -> Result<Arc<dyn StorageAdapter>, StoreError> {
        let (_, factory) = self
            .entries
            .iter()
            .find(|(matcher, _)| matcher(connector))
            .ok_or_else(|| StoreError::UnsupportedConnector(connector.to_string()))?;
        let adapter = factory(connector)?;
        tracing::debug!(connector, adapter = adapter.name(), "resolved storage adapter");
        Ok(adapter)
    }
}
