//! HTTP handlers for the sync protocol.

use crate::authz::AccessRequest;
use crate::listen::ListenError;
use crate::middleware::ClientOrigin;
use crate::tokens::TokenError;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ripple_types::{
    AccessMode, CallError, ListenDescriptor, ListenRequest, PollResponse, ProxyCall, ProxyMethod,
    ProxyRequest, ProxyResponse, ReadyResponse, StatusResponse, TokenQuery,
};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    InternalServerError(String),
    /// A failed `emit` or `data` call. The body echoes the call.
    #[error("{error}")]
    Proxy {
        status: StatusCode,
        error: String,
        method: String,
        args: Value,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Proxy {
                status,
                error,
                method,
                args,
            } => {
                let body = ProxyResponse {
                    result: Value::Null,
                    args,
                    method,
                    error: Some(error),
                };
                return (status, Json(body)).into_response();
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::TooManyConnections => ApiError::TooManyRequests(err.to_string()),
            TokenError::Invalid(_) => ApiError::InternalServerError(err.to_string()),
            TokenError::Store(e) => {
                tracing::error!(error = %e, "token storage failure");
                ApiError::InternalServerError(e.to_string())
            }
        }
    }
}

impl From<ListenError> for ApiError {
    fn from(err: ListenError) -> Self {
        match err {
            ListenError::MissingCollection | ListenError::UnknownFilter(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ListenError::Token(e) => e.into(),
        }
    }
}

fn descriptor(request: ListenRequest) -> ListenDescriptor {
    ListenDescriptor::new(
        request.collection.unwrap_or_default(),
        request.id,
        request.filter,
    )
}

/// Handler for `GET {prefix}ready`.
///
/// Parks until storage has started, then admits a new session.
pub async fn ready_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ClientOrigin(origin)): Extension<ClientOrigin>,
) -> Result<Json<ReadyResponse>, ApiError> {
    state.wait_ready().await;
    let token = state.tokens.admit(&origin).await?;
    Ok(Json(ReadyResponse {
        status: "success".to_string(),
        token,
    }))
}

/// Handler for `GET {prefix}quit`.
pub async fn quit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.tokens.require(&query.token).await?;
    state
        .tokens
        .invalidate(&json!({"token": query.token}))
        .await?;
    state.listens.release_token(&query.token);
    Ok(Json(StatusResponse::success()))
}

/// Handler for `GET {prefix}on`, the long poll.
pub async fn on_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    state.tokens.require(&query.token).await?;
    state.tokens.touch(&query.token).await?;
    let events = state.delivery.poll(&query.token).await;
    Ok(Json(PollResponse { events }))
}

/// Handler for `POST {prefix}listen`.
pub async fn listen_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ListenRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let token = request.token.clone();
    state.listens.register(&token, descriptor(request)).await?;
    Ok(Json(StatusResponse::success()))
}

/// Handler for `POST {prefix}listen/stop`.
pub async fn listen_stop_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ListenRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let token = request.token.clone();
    state.listens.unregister(&token, descriptor(request)).await?;
    Ok(Json(StatusResponse::success()))
}

/// Handler for `POST {prefix}emit`.
pub async fn emit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ClientOrigin(origin)): Extension<ClientOrigin>,
    Json(request): Json<ProxyRequest>,
) -> Result<Json<ProxyResponse>, ApiError> {
    proxy_request(AccessMode::Emit, &state, origin, request).await
}

/// Handler for `POST {prefix}data`.
pub async fn data_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ClientOrigin(origin)): Extension<ClientOrigin>,
    Json(request): Json<ProxyRequest>,
) -> Result<Json<ProxyResponse>, ApiError> {
    proxy_request(AccessMode::Data, &state, origin, request).await
}

async fn proxy_request(
    mode: AccessMode,
    state: &AppState,
    origin: String,
    request: ProxyRequest,
) -> Result<Json<ProxyResponse>, ApiError> {
    let ProxyRequest {
        token,
        method: method_name,
        args,
    } = request;
    state.tokens.require(&token).await?;

    let failure = |status: StatusCode, error: String| ApiError::Proxy {
        status,
        error,
        method: method_name.clone(),
        args: args.clone(),
    };

    let method = match method_name.parse::<ProxyMethod>() {
        Ok(method) if method.mode() == mode => method,
        _ => {
            let error = CallError::UnknownMethod(method_name.clone()).to_string();
            return Err(failure(StatusCode::BAD_REQUEST, error));
        }
    };

    let positional = match &args {
        Value::Array(items) if !items.is_empty() => items.clone(),
        _ => {
            let error = CallError::EmptyArguments.to_string();
            return Err(failure(StatusCode::FORBIDDEN, error));
        }
    };

    let access = AccessRequest {
        mode,
        method,
        args: positional.clone(),
        token,
        origin,
    };
    match state.gate.is_allowed(&access).await {
        Ok(true) => {}
        Ok(false) => {
            let error = format!("{method} not allowed with {args}");
            return Err(failure(StatusCode::FORBIDDEN, error));
        }
        Err(e) => return Err(failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }

    let call = ProxyCall::parse(method, &positional)
        .map_err(|e| failure(StatusCode::BAD_REQUEST, e.to_string()))?;
    // Session bookkeeping collections are never reachable from clients.
    let reserved = &state.config.collection_prefix;
    if !reserved.is_empty() && call.collection().starts_with(reserved.as_str()) {
        let error = format!("{method} not allowed with {args}");
        return Err(failure(StatusCode::FORBIDDEN, error));
    }
    let result = state
        .proxy
        .execute(call)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut echoed = args.clone();
    if method == ProxyMethod::InsertOne {
        let inserted = result.get("insertedIds").and_then(|ids| ids.get(0));
        if let (Value::Array(items), Some(id)) = (&mut echoed, inserted) {
            items.push(id.clone());
        }
    }

    Ok(Json(ProxyResponse {
        result,
        args: echoed,
        method: method_name.clone(),
        error: None,
    }))
}
