//! Named server-side transforms applied to events before delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

/// A registered filter: takes the event arguments, returns the arguments to
/// deliver.
pub type FilterFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Vec<Value>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: Arc<RwLock<HashMap<String, FilterFn>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` under `name`, replacing any previous one.
    pub fn register<F, Fut>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Value>> + Send + 'static,
    {
        let filter: FilterFn = Arc::new(move |args| filter(args).boxed());
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Option<FilterFn> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_filter_transforms_args() {
        let filters = FilterRegistry::new();
        filters.register("upper", |mut args: Vec<Value>| async move {
            if let Some(Value::String(kind)) = args.first_mut() {
                *kind = kind.to_uppercase();
            }
            args
        });

        let filter = filters.get("upper").expect("registered");
        assert_eq!(filter(vec![json!("insert")]).await, vec![json!("INSERT")]);
        assert!(!filters.contains("lower"));
    }
}
