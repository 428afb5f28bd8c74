//! Authorization gate consulted before every proxied call.
//!
//! A strategy answers with a [`Decision`]: an immediate verdict, a deferred
//! one, or `Malformed` when it cannot produce either. A malformed answer fails
//! the call it was asked about with a configuration error and nothing else.

use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use ripple_types::{AccessMode, ProxyMethod};
use serde_json::Value;
use thiserror::Error;

/// What the gate is asked to approve.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub mode: AccessMode,
    pub method: ProxyMethod,
    pub args: Vec<Value>,
    pub token: String,
    pub origin: String,
}

pub enum Decision {
    Ready(bool),
    Deferred(BoxFuture<'static, bool>),
    Malformed(String),
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        Self::Ready(allowed)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Authorization strategy must return true, false or a future: {0}")]
    Configuration(String),
}

pub trait AuthorizationStrategy: Send + Sync {
    fn decide(&self, request: &AccessRequest) -> Decision;
}

/// The default strategy.
pub struct AllowAll;

impl AuthorizationStrategy for AllowAll {
    fn decide(&self, _request: &AccessRequest) -> Decision {
        Decision::Ready(true)
    }
}

impl<F> AuthorizationStrategy for F
where
    F: Fn(&AccessRequest) -> Decision + Send + Sync,
{
    fn decide(&self, request: &AccessRequest) -> Decision {
        self(request)
    }
}

#[derive(Clone)]
pub struct AuthorizationGate {
    strategy: Arc<RwLock<Arc<dyn AuthorizationStrategy>>>,
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self {
            strategy: Arc::new(RwLock::new(Arc::new(AllowAll))),
        }
    }
}

impl AuthorizationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the strategy for all subsequent calls.
    pub fn set_strategy(&self, strategy: impl AuthorizationStrategy + 'static) {
        *self
            .strategy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(strategy);
    }

    pub async fn is_allowed(&self, request: &AccessRequest) -> Result<bool, GateError> {
        let strategy = self
            .strategy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match strategy.decide(request) {
            Decision::Ready(allowed) => Ok(allowed),
            Decision::Deferred(verdict) => Ok(verdict.await),
            Decision::Malformed(reason) => {
                tracing::error!(method = %request.method, reason = %reason, "malformed authorization strategy");
                Err(GateError::Configuration(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    fn request(method: ProxyMethod) -> AccessRequest {
        AccessRequest {
            mode: method.mode(),
            method,
            args: vec![json!("t")],
            token: "tok".to_string(),
            origin: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn default_allows_everything() {
        let gate = AuthorizationGate::new();
        assert!(gate.is_allowed(&request(ProxyMethod::Remove)).await.unwrap());
    }

    #[tokio::test]
    async fn immediate_and_deferred_verdicts() {
        let gate = AuthorizationGate::new();
        gate.set_strategy(|request: &AccessRequest| match request.mode {
            AccessMode::Data => Decision::from(true),
            AccessMode::Emit => Decision::Deferred(async { false }.boxed()),
        });
        assert!(gate.is_allowed(&request(ProxyMethod::Find)).await.unwrap());
        assert!(!gate.is_allowed(&request(ProxyMethod::InsertOne)).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_strategy_fails_only_that_call() {
        let gate = AuthorizationGate::new();
        gate.set_strategy(|request: &AccessRequest| {
            if request.method == ProxyMethod::Count {
                Decision::Malformed("returned a number".to_string())
            } else {
                Decision::Ready(true)
            }
        });
        assert!(matches!(
            gate.is_allowed(&request(ProxyMethod::Count)).await,
            Err(GateError::Configuration(_))
        ));
        assert!(gate.is_allowed(&request(ProxyMethod::Find)).await.unwrap());
    }
}
