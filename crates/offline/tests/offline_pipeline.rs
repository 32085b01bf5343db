use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::{Notify, watch};
use tradeflow_core::{JobId, Verb};
use tradeflow_offline::operations::{NewItem, Unit};
use tradeflow_offline::transport::{RawResponse, ScriptedTransport};
use tradeflow_offline::types::{DeadLetter, is_placeholder_id};
use tradeflow_offline::{
    AppState, ConnectivityMonitor, GatewayError, InMemoryJobQueue, Job, JobQueue, QueueEntry,
    QueueError, ReplayEngine, ReplayError, ReplayPolicy, Request, SkipReason, Transport,
    TransportError,
};

fn rice() -> NewItem {
    NewItem {
        name: "Rice".into(),
        sku: "R1".into(),
        unit: Unit::Kg,
        category: None,
        min_stock: None,
    }
}

fn job(endpoint: &str) -> QueueEntry {
    QueueEntry::new(Job::from_request(&Request::post(endpoint, json!({"at": endpoint}))).unwrap())
}

fn state(monitor: ConnectivityMonitor) -> (AppState, Arc<InMemoryJobQueue>, Arc<ScriptedTransport>) {
    let queue = InMemoryJobQueue::arc();
    let transport = ScriptedTransport::arc();
    let state = AppState::with_parts(queue.clone(), transport.clone(), monitor);
    (state, queue, transport)
}

#[tokio::test]
async fn offline_create_returns_placeholder_and_queues_one_job() {
    let (state, queue, transport) = state(ConnectivityMonitor::offline());

    let receipt = state.client.create_item(rice()).await.unwrap();

    assert!(receipt.id.starts_with("offline-"));
    assert!(receipt.is_provisional());
    assert_eq!(queue.len().await.unwrap(), 1);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn reconnect_flush_delivers_the_queued_job() {
    let (state, queue, transport) = state(ConnectivityMonitor::offline());
    state.client.create_item(rice()).await.unwrap();

    state.monitor.set_online();
    let report = state.sync_now().await.unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert_eq!(queue.len().await.unwrap(), 0);
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].endpoint, "/api/items");
    assert_eq!(calls[0].verb, Verb::Post);
    assert_eq!(
        calls[0].payload,
        Some(json!({"name": "Rice", "sku": "R1", "unit": "kg"}))
    );
}

#[tokio::test]
async fn flush_keeps_exactly_the_failed_job() {
    let (state, queue, transport) = state(ConnectivityMonitor::online());
    let jobs = [job("/api/items"), job("/api/warehouses"), job("/api/sales")];
    for j in &jobs {
        queue.append(j.clone()).await.unwrap();
    }
    transport.push(Ok(ScriptedTransport::ok_envelope(json!({"id": "1"}))));
    transport.push(Err(TransportError::Connect("connection reset".into())));
    transport.push(Ok(ScriptedTransport::ok_envelope(json!({"id": "3"}))));

    state.sync_now().await.unwrap();

    let left = queue.list().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id(), jobs[1].id());
    assert_eq!(left[0].attempts, 1);
}

#[tokio::test]
async fn server_rejection_propagates_without_queueing() {
    let (state, queue, transport) = state(ConnectivityMonitor::online());
    transport.push(Ok(ScriptedTransport::error_envelope(400, "name required")));

    let err = state.client.create_item(rice()).await.unwrap_err();

    assert_eq!(err.to_string(), "name required");
    assert!(matches!(err, GatewayError::Application { status: 400, .. }));
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn back_to_back_flushes_of_an_empty_queue_make_no_calls() {
    let (state, _, transport) = state(ConnectivityMonitor::online());

    let first = state.sync_now().await.unwrap();
    let second = state.sync_now().await.unwrap();

    assert_eq!(first.skipped, Some(SkipReason::Empty));
    assert_eq!(second.skipped, Some(SkipReason::Empty));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn offline_reads_fail_and_never_queue() {
    let queue = InMemoryJobQueue::arc();
    let transport = Arc::new(ScriptedTransport::unreachable());
    let state = AppState::with_parts(queue.clone(), transport, ConnectivityMonitor::offline());

    let err = state.client.list_items().await.unwrap_err();

    assert!(matches!(err, GatewayError::Transport(_)));
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn transport_failure_while_online_soft_succeeds_then_replays() {
    let (state, queue, transport) = state(ConnectivityMonitor::online());
    transport.push(Err(TransportError::Connect("connection refused".into())));

    let receipt = state.client.delete_warehouse("wh-1").await.unwrap();
    assert!(is_placeholder_id(&receipt.id));

    state.sync_now().await.unwrap();
    assert!(queue.is_empty().await.unwrap());

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.endpoint == "/api/warehouses/wh-1" && c.verb == Verb::Delete));
}

/// Holds every call until the gate is opened.
struct GatedTransport {
    open: watch::Sender<bool>,
    started: Notify,
    calls: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
}

impl GatedTransport {
    fn new() -> Arc<Self> {
        let (open, _) = watch::channel(false);
        Arc::new(Self {
            open,
            started: Notify::new(),
            calls: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
        })
    }

    fn open(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(request.endpoint.clone());
        self.started.notify_one();

        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        Ok(ScriptedTransport::ok_envelope(json!({})))
    }
}

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_extra_pass() {
    let queue = InMemoryJobQueue::arc();
    let first = job("/api/items");
    let second = job("/api/warehouses");
    queue.append(first.clone()).await.unwrap();
    queue.append(second.clone()).await.unwrap();

    let transport = GatedTransport::new();
    let engine = Arc::new(ReplayEngine::new(
        queue.clone(),
        transport.clone(),
        ConnectivityMonitor::online(),
    ));

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.flush().await }
    });
    transport.started.notified().await;
    assert!(engine.is_flushing());

    // Reconnect and foreground land while the first pass is blocked.
    let late = job("/api/sales");
    queue.append(late.clone()).await.unwrap();
    assert_eq!(engine.flush().await.unwrap().skipped, Some(SkipReason::Coalesced));
    assert_eq!(engine.flush().await.unwrap().skipped, Some(SkipReason::Coalesced));

    transport.open();
    let report = running.await.unwrap().unwrap();

    // One pass over the snapshot, one re-run for the late job.
    assert_eq!(report.delivered, vec![first.id(), second.id(), late.id()]);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *transport.endpoints.lock().unwrap(),
        ["/api/items", "/api/warehouses", "/api/sales"]
    );
    assert!(queue.is_empty().await.unwrap());
    assert!(!engine.is_flushing());
}

/// Fails the next `list` once, then behaves like the in-memory queue.
struct FlakyQueue {
    inner: InMemoryJobQueue,
    fail_next_list: AtomicBool,
    fail_next_commit: AtomicBool,
}

impl FlakyQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryJobQueue::new(),
            fail_next_list: AtomicBool::new(false),
            fail_next_commit: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn append(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.inner.append(entry).await
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        if self.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Storage("disk unavailable".into()));
        }
        self.inner.list().await
    }

    async fn save(&self, remaining: Vec<QueueEntry>) -> Result<(), QueueError> {
        self.inner.save(remaining).await
    }

    async fn save_residue(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
    ) -> Result<(), QueueError> {
        self.inner.save_residue(snapshot, remaining).await
    }

    async fn commit_pass(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
        dead: Vec<DeadLetter>,
    ) -> Result<(), QueueError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Storage("disk full".into()));
        }
        self.inner.commit_pass(snapshot, remaining, dead).await
    }

    async fn dead_letter(&self, letters: Vec<DeadLetter>) -> Result<(), QueueError> {
        self.inner.dead_letter(letters).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.inner.list_dead_letters().await
    }

    async fn requeue_dead_letter(&self, id: JobId) -> Result<QueueEntry, QueueError> {
        self.inner.requeue_dead_letter(id).await
    }

    async fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        self.inner.purge_dead_letters().await
    }
}

#[tokio::test]
async fn storage_errors_surface_and_release_the_guard() {
    let queue = FlakyQueue::new();
    queue.fail_next_list.store(true, Ordering::SeqCst);
    queue.append(job("/api/items")).await.unwrap();
    let transport = ScriptedTransport::arc();
    let engine = ReplayEngine::new(queue.clone(), transport.clone(), ConnectivityMonitor::online());

    let err = engine.flush().await.unwrap_err();
    assert!(matches!(err, ReplayError::Queue(QueueError::Storage(_))));
    assert!(!engine.is_flushing());

    let report = engine.flush().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn failed_commit_leaves_the_job_pending_and_not_dead_lettered() {
    let queue = FlakyQueue::new();
    queue.fail_next_commit.store(true, Ordering::SeqCst);
    let entry = job("/api/sales");
    queue.append(entry.clone()).await.unwrap();

    let transport = ScriptedTransport::arc();
    transport.set_fallback(Ok(ScriptedTransport::error_envelope(500, "database down")));
    let engine = ReplayEngine::new(queue.clone(), transport.clone(), ConnectivityMonitor::online())
        .with_policy(ReplayPolicy::default().with_max_attempts(1));

    let err = engine.flush().await.unwrap_err();
    assert!(matches!(err, ReplayError::Queue(QueueError::Storage(_))));
    assert!(queue.list_dead_letters().await.unwrap().is_empty());
    let pending = queue.list().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);

    let report = engine.flush().await.unwrap();
    assert_eq!(report.dead_lettered, vec![entry.id()]);
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(queue.list_dead_letters().await.unwrap().len(), 1);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn dead_letters_can_be_retried_from_app_state() {
    let queue = InMemoryJobQueue::arc();
    let transport = ScriptedTransport::arc();
    transport.push(Ok(ScriptedTransport::error_envelope(500, "database down")));
    let monitor = ConnectivityMonitor::online();
    let engine = ReplayEngine::new(queue.clone(), transport.clone(), monitor.clone())
        .with_policy(ReplayPolicy::default().with_max_attempts(1));

    let entry = job("/api/purchases");
    queue.append(entry.clone()).await.unwrap();
    let report = engine.flush().await.unwrap();
    assert_eq!(report.dead_lettered, vec![entry.id()]);

    let state = AppState::with_parts(queue.clone(), transport.clone(), monitor);
    let dead = state.dead_letters().await.unwrap();
    assert_eq!(dead[0].entry.last_error.as_deref(), Some("HTTP 500: database down"));

    state.retry_dead_letter(entry.id()).await.unwrap();
    let report = state.sync_now().await.unwrap();
    assert_eq!(report.delivered, vec![entry.id()]);
    assert!(state.dead_letters().await.unwrap().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// N persisted jobs are attempted exactly once each, in enqueue order,
    /// and failures stay behind in their original relative order.
    #[test]
    fn flush_attempts_every_job_once_in_order(outcomes in prop::collection::vec(any::<bool>(), 0..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let queue = InMemoryJobQueue::arc();
            let transport = ScriptedTransport::arc();
            let mut expected_left = Vec::new();
            let mut endpoints = Vec::new();

            for (i, ok) in outcomes.iter().enumerate() {
                let endpoint = format!("/api/items/{i}");
                let entry = QueueEntry::new(Job::from_request(&Request::delete(&endpoint)).unwrap());
                if !ok {
                    expected_left.push(entry.id());
                }
                queue.append(entry).await.unwrap();
                transport.push(if *ok {
                    Ok(ScriptedTransport::ok_envelope(json!(null)))
                } else {
                    Err(TransportError::Connect("down".into()))
                });
                endpoints.push(endpoint);
            }

            let engine = ReplayEngine::new(queue.clone(), transport.clone(), ConnectivityMonitor::online());
            engine.flush().await.unwrap();

            let attempted: Vec<String> = transport.calls().into_iter().map(|c| c.endpoint).collect();
            assert_eq!(attempted, endpoints);

            let left: Vec<JobId> = queue.list().await.unwrap().iter().map(QueueEntry::id).collect();
            assert_eq!(left, expected_left);
        });
    }
}
