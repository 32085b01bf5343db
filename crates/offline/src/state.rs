//! Wiring of the pipeline components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tradeflow_core::JobId;

use crate::client::TradeClient;
use crate::config::OfflineConfig;
use crate::connectivity::{ConnectivityMonitor, TriggerReason};
use crate::gateway::RequestGateway;
use crate::probe::HealthProbe;
use crate::queue::{JobQueue, QueueError, SqliteJobQueue};
use crate::replay::{FlushReport, ReplayEngine, ReplayError};
use crate::transport::{HttpTransport, Transport};
use crate::types::{DeadLetter, QueueEntry};
use crate::worker::{SyncEvent, SyncWorker};

/// Shared handles to every pipeline component.
///
/// The queue, transport and monitor are shared between the gateway, the
/// replay engine and the health probe.
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub transport: Arc<dyn Transport>,
    pub monitor: ConnectivityMonitor,
    pub gateway: Arc<RequestGateway>,
    pub engine: Arc<ReplayEngine>,
    pub client: TradeClient,
}

impl AppState {
    /// Build the production stack: HTTP transport and SQLite queue.
    ///
    /// The database connection is opened lazily on first use.
    pub fn from_config(config: &OfflineConfig) -> anyhow::Result<Self> {
        let mut transport = HttpTransport::new(&config.api_url, config.request_timeout)?;
        if let Some(token) = &config.auth_token {
            tracing::info!("using API authentication token");
            transport = transport.with_token(token.clone());
        }
        let api_base = transport.base_url().clone();

        let queue = match &config.queue_db {
            Some(path) => SqliteJobQueue::at_path(path),
            None => SqliteJobQueue::at_default_path()
                .context("failed to resolve offline queue location")?,
        };

        let monitor = ConnectivityMonitor::online();
        let queue: Arc<dyn JobQueue> = Arc::new(queue);
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let gateway = RequestGateway::new(queue.clone(), transport.clone(), monitor.clone())
            .with_api_base(api_base);
        let engine = ReplayEngine::new(queue.clone(), transport.clone(), monitor.clone())
            .with_policy(config.replay_policy);

        Ok(Self::assemble(queue, transport, monitor, gateway, engine))
    }

    /// Build from explicit parts, with the default replay policy.
    pub fn with_parts(
        queue: Arc<dyn JobQueue>,
        transport: Arc<dyn Transport>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        let gateway = RequestGateway::new(queue.clone(), transport.clone(), monitor.clone());
        let engine = ReplayEngine::new(queue.clone(), transport.clone(), monitor.clone());
        Self::assemble(queue, transport, monitor, gateway, engine)
    }

    fn assemble(
        queue: Arc<dyn JobQueue>,
        transport: Arc<dyn Transport>,
        monitor: ConnectivityMonitor,
        gateway: RequestGateway,
        engine: ReplayEngine,
    ) -> Self {
        let gateway = Arc::new(gateway);
        Self {
            client: TradeClient::new(gateway.clone()),
            queue,
            transport,
            monitor,
            gateway,
            engine: Arc::new(engine),
        }
    }

    /// Flush now and report what happened.
    pub async fn sync_now(&self) -> Result<FlushReport, ReplayError> {
        tracing::info!(reason = ?TriggerReason::Manual, "manual sync requested");
        self.engine.flush().await
    }

    pub async fn pending_jobs(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.queue.list().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.queue.list_dead_letters().await
    }

    /// Give a dead-lettered job another chance; it replays on the next flush.
    pub async fn retry_dead_letter(&self, id: JobId) -> Result<QueueEntry, QueueError> {
        let entry = self.queue.requeue_dead_letter(id).await?;
        tracing::info!(job_id = %id, "dead letter requeued");
        Ok(entry)
    }

    /// Start the health probe and the sync worker.
    pub fn start_background(&self, probe_interval: Duration) -> Background {
        let probe = Arc::new(HealthProbe::new(self.transport.clone()));
        let worker = SyncWorker::new(self.engine.clone(), self.monitor.clone());

        let handles = vec![
            worker.start(),
            probe.clone().spawn(self.monitor.clone(), probe_interval),
        ];

        Background {
            worker,
            probe,
            handles,
        }
    }
}

/// Running background tasks.
pub struct Background {
    worker: SyncWorker,
    probe: Arc<HealthProbe>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.worker.events()
    }

    /// Signal both tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.worker.shutdown();
        self.probe.shutdown();
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background task panicked");
            }
        }
    }
}
