//! Shared test utilities for mvirt-provider integration tests.
//!
//! `TestServer` runs a minimal in-process cluster API: namespaced objects
//! under `/apis/{group}/{version}/namespaces/{ns}/{plural}` with
//! server-assigned metadata and load balancer addresses.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use mvirt_provider::{ProviderConfig, RestClient, Timeouts};

type Shared = Arc<RwLock<MockState>>;

#[derive(Default)]
pub struct MockState {
    pub objects: BTreeMap<String, Value>,
    pub requests: Vec<String>,
    /// Answer every request with 503 while set.
    pub unavailable: bool,
    next_version: u64,
    next_address: u8,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.message, "code": self.status.as_u16()});
        (self.status, Json(body)).into_response()
    }
}

type CollectionPath = Path<(String, String, String, String)>;
type ObjectPath = Path<(String, String, String, String, String)>;

fn key(group: &str, version: &str, ns: &str, plural: &str, name: &str) -> String {
    format!("{group}/{version}/{ns}/{plural}/{name}")
}

fn check_available(state: &mut MockState, request: String) -> Result<(), ApiError> {
    state.requests.push(request);
    if state.unavailable {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Not leader"));
    }
    Ok(())
}

async fn create_object(
    State(state): State<Shared>,
    Path((group, version, ns, plural)): CollectionPath,
    Json(mut body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut state = state.write().await;
    check_available(&mut state, format!("POST {ns}/{plural}"))?;

    let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
    if name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "metadata.name is required"));
    }
    let key = key(&group, &version, &ns, &plural, &name);
    if state.objects.contains_key(&key) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("{plural} {name} already exists"),
        ));
    }

    state.next_version += 1;
    let metadata = &mut body["metadata"];
    metadata["namespace"] = json!(ns);
    metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
    metadata["resourceVersion"] = json!(state.next_version.to_string());
    metadata["creationTimestamp"] = json!("2026-01-01T00:00:00Z");

    if plural == "loadbalancers" {
        state.next_address += 1;
        body["status"] = json!({
            "address": format!("10.53.0.{}", state.next_address),
            "ready": true
        });
    }

    state.objects.insert(key, body.clone());
    Ok((StatusCode::CREATED, Json(body)))
}

async fn get_object(
    State(state): State<Shared>,
    Path((group, version, ns, plural, name)): ObjectPath,
) -> Result<Json<Value>, ApiError> {
    let mut state = state.write().await;
    check_available(&mut state, format!("GET {ns}/{plural}/{name}"))?;

    state
        .objects
        .get(&key(&group, &version, &ns, &plural, &name))
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("{plural} {name} not found")))
}

async fn update_object(
    State(state): State<Shared>,
    Path((group, version, ns, plural, name)): ObjectPath,
    Json(mut body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mut state = state.write().await;
    check_available(&mut state, format!("PUT {ns}/{plural}/{name}"))?;

    let key = key(&group, &version, &ns, &plural, &name);
    let Some(current) = state.objects.get(&key) else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("{plural} {name} not found"),
        ));
    };
    let current_meta = current["metadata"].clone();
    if body["metadata"]["resourceVersion"] != current_meta["resourceVersion"] {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "the object has been modified",
        ));
    }

    state.next_version += 1;
    let metadata = &mut body["metadata"];
    metadata["uid"] = current_meta["uid"].clone();
    metadata["creationTimestamp"] = current_meta["creationTimestamp"].clone();
    metadata["resourceVersion"] = json!(state.next_version.to_string());

    state.objects.insert(key, body.clone());
    Ok(Json(body))
}

async fn delete_object(
    State(state): State<Shared>,
    Path((group, version, ns, plural, name)): ObjectPath,
) -> Result<StatusCode, ApiError> {
    let mut state = state.write().await;
    check_available(&mut state, format!("DELETE {ns}/{plural}/{name}"))?;

    match state.objects.remove(&key(&group, &version, &ns, &plural, &name)) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("{plural} {name} not found"),
        )),
    }
}

fn create_router(state: Shared) -> Router {
    Router::new()
        .route(
            "/apis/{group}/{version}/namespaces/{ns}/{plural}",
            post(create_object),
        )
        .route(
            "/apis/{group}/{version}/namespaces/{ns}/{plural}/{name}",
            get(get_object).put(update_object).delete(delete_object),
        )
        .with_state(state)
}

/// In-process cluster API.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Shared,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(RwLock::new(MockState::default()));
        let router = create_router(state.clone());

        // Port 0 lets the OS choose
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> Arc<RestClient> {
        Arc::new(RestClient::new(&self.endpoint()).expect("Invalid endpoint"))
    }

    pub fn config(&self) -> ProviderConfig {
        ProviderConfig {
            endpoint: self.endpoint(),
            timeouts: Timeouts::uniform(Duration::from_secs(5)),
            poll_interval: Duration::from_millis(20),
        }
    }

    pub async fn object(&self, group: &str, version: &str, ns: &str, plural: &str, name: &str) -> Option<Value> {
        self.state
            .read()
            .await
            .objects
            .get(&key(group, version, ns, plural, name))
            .cloned()
    }

    pub async fn requests(&self) -> Vec<String> {
        self.state.read().await.requests.clone()
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
