use ripple_server::config::SyncConfig;
use ripple_server::{app, AppState};
use ripple_store::{MemoryAdapter, StorageAdapter};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_server(config: SyncConfig) -> (String, AppState) {
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
    let state = AppState::new(adapter, config);
    state.start().await.unwrap();

    let app = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("http://{addr}/api/mm"), state)
}

fn config() -> SyncConfig {
    SyncConfig {
        idle_timeout_ms: 1_000,
        grouping_delay_ms: 50,
        max_tokens_per_origin: 2,
        ..SyncConfig::default()
    }
}

async fn ready(client: &reqwest::Client, base: &str) -> reqwest::Response {
    client.get(format!("{base}/ready")).send().await.unwrap()
}

#[tokio::test]
async fn peer_address_is_the_admission_origin() {
    let (base, state) = spawn_server(config()).await;
    let client = reqwest::Client::new();

    assert!(ready(&client, &base).await.status().is_success());
    assert!(ready(&client, &base).await.status().is_success());
    let refused = ready(&client, &base).await;
    assert_eq!(refused.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    let tokens = state.tokens.tokens_for("127.0.0.1").await.unwrap();
    assert_eq!(tokens.len(), 2);

    // Invalidating the origin frees its slots.
    state
        .invalidate_tokens(&json!({"ip": "127.0.0.1"}))
        .await
        .unwrap();
    assert!(ready(&client, &base).await.status().is_success());
}

#[tokio::test]
async fn every_insert_is_delivered_once() {
    let (base, state) = spawn_server(config()).await;
    let client = reqwest::Client::new();
    let body: Value = ready(&client, &base).await.json().await.unwrap();
    let token = body["token"].as_str().unwrap().to_string();

    client
        .post(format!("{base}/listen"))
        .json(&json!({"token": token, "collection": "items"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let poller = tokio::spawn({
        let client = client.clone();
        let url = format!("{base}/on?token={token}");
        async move {
            let mut seen = Vec::new();
            let mut empty_polls = 0;
            while empty_polls < 2 {
                let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
                let events = body["events"].as_array().unwrap().clone();
                if events.is_empty() {
                    empty_polls += 1;
                }
                seen.extend(events);
            }
            seen
        }
    });
    while state.delivery.listener_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    const N: usize = 12;
    for n in 0..N {
        let response = client
            .post(format!("{base}/emit"))
            .json(&json!({"token": token, "method": "insertOne", "args": ["items", {"n": n}]}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    let events = poller.await.unwrap();
    let inserts: Vec<&Value> = events.iter().filter(|e| e["args"][0] == "insert").collect();
    assert_eq!(inserts.len(), N);

    let ids: HashSet<&str> = inserts
        .iter()
        .map(|e| e["args"][1]["item"]["_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), N);

    let relay_ids: HashSet<&str> = inserts.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(relay_ids.len(), N);
}

#[tokio::test]
async fn idle_poll_returns_empty_batch() {
    let (base, _) = spawn_server(config()).await;
    let client = reqwest::Client::new();
    let body: Value = ready(&client, &base).await.json().await.unwrap();
    let token = body["token"].as_str().unwrap();

    let started = std::time::Instant::now();
    let body: Value = client
        .get(format!("{base}/on?token={token}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"events": []}));
    assert!(started.elapsed() >= Duration::from_millis(900));
}
