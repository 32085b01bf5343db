use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tradeflow_core::JobId;
use tradeflow_offline::operations::{NewItem, Unit};
use tradeflow_offline::{AppState, GatewayError, HealthProbe, OfflineConfig, TransportError};

#[derive(Debug, Clone)]
struct Received {
    authorization: Option<String>,
    body: Value,
}

#[derive(Default)]
struct Stub {
    items: Mutex<Vec<Value>>,
    received: Mutex<Vec<Received>>,
    /// Delay applied to the next create only.
    stall_next_create: Mutex<Option<Duration>>,
}

type Shared = Arc<Stub>;

async fn health() -> &'static str {
    "ok"
}

async fn list_items(State(stub): State<Shared>) -> Json<Value> {
    let items = stub.items.lock().unwrap().clone();
    Json(json!({ "ok": true, "data": items }))
}

async fn create_item(
    State(stub): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    stub.received.lock().unwrap().push(Received {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.clone(),
    });

    let stall = stub.stall_next_create.lock().unwrap().take();
    if let Some(delay) = stall {
        tokio::time::sleep(delay).await;
    }

    let mut items = stub.items.lock().unwrap();
    if items.iter().any(|i| i["sku"] == body["sku"]) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "error": "sku already exists" })),
        );
    }

    let id = format!("srv-{}", items.len() + 1);
    let mut item = body;
    item["id"] = json!(id);
    items.push(item);
    (
        StatusCode::CREATED,
        Json(json!({ "ok": true, "data": { "id": id } })),
    )
}

struct TestServer {
    base_url: String,
    stub: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let stub = Shared::default();
        let app = Router::new()
            .route("/health", get(health))
            .route("/api/items", get(list_items).post(create_item))
            .with_state(stub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            stub,
            handle,
        }
    }

    fn received(&self) -> Vec<Received> {
        self.stub.received.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A URL nothing listens on.
async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

struct TempDb(std::path::PathBuf);

impl TempDb {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("tradeflow-blackbox-{}.db", JobId::new())))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn config(api_url: &str, db: &TempDb) -> OfflineConfig {
    OfflineConfig {
        api_url: api_url.to_string(),
        auth_token: Some("t0ken".into()),
        queue_db: Some(db.0.clone()),
        request_timeout: Duration::from_secs(5),
        ..OfflineConfig::default()
    }
}

fn item(sku: &str) -> NewItem {
    NewItem {
        name: "Rice".into(),
        sku: sku.into(),
        unit: Unit::Kg,
        category: Some("grains".into()),
        min_stock: None,
    }
}

#[tokio::test]
async fn offline_write_is_delivered_after_reconnect() {
    let srv = TestServer::spawn().await;
    let db = TempDb::new();
    let state = AppState::from_config(&config(&srv.base_url, &db)).unwrap();

    state.monitor.set_offline();
    let receipt = state.client.create_item(item("R1")).await.unwrap();
    assert!(receipt.is_provisional());
    assert!(srv.received().is_empty());
    assert_eq!(state.pending_jobs().await.unwrap().len(), 1);

    state.monitor.set_online();
    let report = state.sync_now().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(state.pending_jobs().await.unwrap().is_empty());

    let received = srv.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer t0ken"));
    assert_eq!(received[0].body["sku"], "R1");
    assert_eq!(received[0].body["category"], "grains");

    let items = state.client.list_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "srv-1");
}

#[tokio::test]
async fn server_rejection_reaches_the_caller() {
    let srv = TestServer::spawn().await;
    let db = TempDb::new();
    let state = AppState::from_config(&config(&srv.base_url, &db)).unwrap();

    let created = state.client.create_item(item("R1")).await.unwrap();
    assert_eq!(created.id, "srv-1");

    let err = state.client.create_item(item("R1")).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Application { status: 409, ref message } if message == "sku already exists"
    ));
    assert!(state.pending_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_after_sending_is_not_queued_or_replayed() {
    let srv = TestServer::spawn().await;
    *srv.stub.stall_next_create.lock().unwrap() = Some(Duration::from_millis(1500));
    let db = TempDb::new();
    let config = OfflineConfig {
        request_timeout: Duration::from_millis(500),
        ..config(&srv.base_url, &db)
    };
    let state = AppState::from_config(&config).unwrap();

    let err = state.client.create_item(item("R1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport(TransportError::Timeout(_))));
    assert!(state.pending_jobs().await.unwrap().is_empty());

    // Let the stalled handler finish before flushing.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let report = state.sync_now().await.unwrap();

    assert_eq!(report.attempted, 0);
    assert_eq!(srv.received().len(), 1);
}

#[tokio::test]
async fn unreachable_server_queues_and_the_queue_survives_restart() {
    let db = TempDb::new();
    let url = closed_url().await;

    {
        let state = AppState::from_config(&config(&url, &db)).unwrap();
        let receipt = state.client.create_item(item("R1")).await.unwrap();
        assert!(receipt.is_provisional());

        let probe = HealthProbe::new(state.transport.clone());
        assert!(!probe.probe(&state.monitor).await);
        assert!(state.monitor.is_offline());
    }

    let restarted = AppState::from_config(&config(&url, &db)).unwrap();
    let pending = restarted.pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job.endpoint(), "/api/items");
}

#[tokio::test]
async fn health_probe_sees_a_live_server() {
    let srv = TestServer::spawn().await;
    let db = TempDb::new();
    let state = AppState::from_config(&config(&srv.base_url, &db)).unwrap();

    let probe = HealthProbe::new(state.transport.clone());
    assert!(probe.check().await);
}
