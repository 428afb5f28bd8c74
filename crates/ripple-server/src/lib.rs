//! Ripple sync server library.
//!
//! Wires the storage adapter, the in-process buses, session tokens, the
//! listen registry and the long-poll delivery hub behind an axum router.

pub mod api;
pub mod authz;
pub mod config;
pub mod delivery;
pub mod filters;
pub mod listen;
pub mod middleware;
pub mod proxy;
pub mod tokens;

use std::sync::Arc;

use authz::{AuthorizationGate, AuthorizationStrategy};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::SyncConfig;
use delivery::DeliveryHub;
use filters::FilterRegistry;
use listen::{DeliveryBus, ListenRegistry};
use proxy::{MutationBus, MutationProxy};
use ripple_bus::EventBus;
use ripple_store::{StorageAdapter, StoreError};
use serde_json::{json, Value};
use tokens::{TokenError, TokenManager};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Protocol tunables.
    pub config: SyncConfig,
    /// Storage behind both the proxy and the session bookkeeping.
    pub adapter: Arc<dyn StorageAdapter>,
    pub tokens: TokenManager,
    pub proxy: MutationProxy,
    pub filters: FilterRegistry,
    pub gate: AuthorizationGate,
    pub listens: ListenRegistry,
    pub delivery: DeliveryHub,
    /// Flips to `true` once the adapter has started.
    ready: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Builds the server state around an adapter. Nothing is admitted until
    /// [`AppState::start`] succeeds.
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: SyncConfig) -> Self {
        let mutations: MutationBus = EventBus::new("mutations", config.max_subscriptions);
        let deliveries: DeliveryBus = EventBus::new("deliveries", config.max_subscriptions);

        let tokens = TokenManager::new(
            adapter.clone(),
            config.tokens_collection(),
            config.events_collection(),
            config.idle_timeout(),
            config.max_tokens_per_origin,
        );
        let proxy = MutationProxy::new(adapter.clone(), mutations.clone());
        let filters = FilterRegistry::new();
        let listens = ListenRegistry::new(
            mutations,
            deliveries.clone(),
            tokens.clone(),
            filters.clone(),
            config.idle_timeout(),
        );
        let delivery = DeliveryHub::new(
            deliveries,
            adapter.clone(),
            config.events_collection(),
            config.idle_timeout(),
            config.grouping_delay(),
        );
        let (ready, _) = watch::channel(false);

        Self {
            config,
            adapter,
            tokens,
            proxy,
            filters,
            gate: AuthorizationGate::new(),
            listens,
            delivery,
            ready: Arc::new(ready),
        }
    }

    /// Starts the adapter and releases parked `ready` requests.
    pub async fn start(&self) -> Result<(), StoreError> {
        self.adapter.start().await?;
        self.ready.send_replace(true);
        tracing::info!(adapter = self.adapter.name(), "sync server ready");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), StoreError> {
        self.ready.send_replace(false);
        self.adapter.stop().await
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once [`AppState::start`] has completed.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Registers a named server-side filter for listen registrations.
    pub fn add_filter<F, Fut>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<Value>> + Send + 'static,
    {
        self.filters.register(name, filter);
    }

    pub fn set_authorization_strategy(&self, strategy: impl AuthorizationStrategy + 'static) {
        self.gate.set_strategy(strategy);
    }

    /// Deletes every token record matching `filter`, e.g. `{"ip": origin}`.
    /// Affected sessions fail their next call and their listens expire at the
    /// next recheck.
    pub async fn invalidate_tokens(&self, filter: &Value) -> Result<u64, TokenError> {
        self.tokens.invalidate(filter).await
    }
}

/// Maximum request body size (2 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let prefix = state.config.normalized_prefix();

    let sync_routes = Router::new()
        .route(&format!("{prefix}ready"), get(api::ready_handler))
        .route(&format!("{prefix}quit"), get(api::quit_handler))
        .route(&format!("{prefix}on"), get(api::on_handler))
        .route(&format!("{prefix}listen"), post(api::listen_handler))
        .route(
            &format!("{prefix}listen/stop"),
            post(api::listen_stop_handler),
        )
        .route(&format!("{prefix}emit"), post(api::emit_handler))
        .route(&format!("{prefix}data"), post(api::data_handler));

    Router::new()
        .route("/health", get(health))
        .merge(sync_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::origin_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
