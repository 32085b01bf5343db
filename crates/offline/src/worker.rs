//! Background worker that flushes the queue on every trigger.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, broadcast};

use crate::connectivity::{ConnectivityMonitor, TriggerReason};
use crate::replay::{FlushReport, ReplayEngine};

const EVENT_CAPACITY: usize = 64;

/// Event payload for a completed flush.
#[derive(Debug, Clone, Serialize)]
pub struct SyncCompletedEvent {
    pub reason: TriggerReason,
    pub report: FlushReport,
}

/// Event payload for a failed flush.
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailedEvent {
    pub reason: TriggerReason,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Completed(SyncCompletedEvent),
    Failed(SyncFailedEvent),
}

/// Wires connectivity triggers to the replay engine.
pub struct SyncWorker {
    engine: Arc<ReplayEngine>,
    monitor: ConnectivityMonitor,
    shutdown: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncWorker {
    pub fn new(engine: Arc<ReplayEngine>, monitor: ConnectivityMonitor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine,
            monitor,
            shutdown: Arc::new(Notify::new()),
            events,
        }
    }

    /// Flush outcomes, one event per trigger handled.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start the background task.
    ///
    /// The task raises `Startup` once so jobs left by a previous session are
    /// drained, then flushes on every trigger until shut down. Flush errors
    /// are logged and reported as events; they never stop the worker.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        let events = self.events.clone();
        // Subscribe before raising Startup so it cannot be missed.
        let mut triggers = self.monitor.subscribe();
        self.monitor.trigger(TriggerReason::Startup);

        tokio::spawn(async move {
            tracing::info!("sync worker started");

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("sync worker received shutdown signal");
                        break;
                    }
                    next = triggers.recv() => {
                        let Some(reason) = next else {
                            tracing::info!("connectivity monitor dropped");
                            break;
                        };
                        Self::handle(&engine, &events, reason).await;
                    }
                }
            }

            tracing::info!("sync worker stopped");
        })
    }

    async fn handle(
        engine: &ReplayEngine,
        events: &broadcast::Sender<SyncEvent>,
        reason: TriggerReason,
    ) {
        tracing::debug!(?reason, "flush triggered");

        let event = match engine.flush().await {
            Ok(report) => {
                if !report.is_skipped() {
                    tracing::info!(
                        ?reason,
                        delivered = report.delivered.len(),
                        retained = report.retained.len(),
                        dead_lettered = report.dead_lettered.len(),
                        "sync completed"
                    );
                }
                SyncEvent::Completed(SyncCompletedEvent { reason, report })
            }
            Err(err) => {
                tracing::error!(?reason, error = %err, "sync failed");
                SyncEvent::Failed(SyncFailedEvent {
                    reason,
                    error: err.to_string(),
                })
            }
        };

        // Nobody listening is fine.
        let _ = events.send(event);
    }

    /// Request graceful shutdown of the worker.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
