//! Health probe: the reachability signal for processes without an OS
//! network callback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::connectivity::ConnectivityMonitor;
use crate::transport::Transport;
use crate::types::Request;

pub const HEALTH_ENDPOINT: &str = "/health";

/// Polls the API health endpoint and feeds the result into a
/// [`ConnectivityMonitor`].
pub struct HealthProbe {
    transport: Arc<dyn Transport>,
    shutdown: Arc<Notify>,
}

impl HealthProbe {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Whether the API answered the health check.
    ///
    /// Any response below 500 counts: the server is up even if it dislikes
    /// the request.
    pub async fn check(&self) -> bool {
        match self.transport.send(&Request::get(HEALTH_ENDPOINT)).await {
            Ok(resp) => resp.status < 500,
            Err(err) => {
                tracing::debug!(error = %err, "health check failed");
                false
            }
        }
    }

    /// Probe once and record the result.
    pub async fn probe(&self, monitor: &ConnectivityMonitor) -> bool {
        let reachable = self.check().await;
        monitor.set_reachable(reachable);
        reachable
    }

    /// Poll every `interval` until [`HealthProbe::shutdown`] is called.
    ///
    /// The first probe runs immediately.
    pub async fn run(&self, monitor: ConnectivityMonitor, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval_secs = interval.as_secs(), "health probe started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("health probe received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.probe(&monitor).await;
                }
            }
        }
        tracing::info!("health probe stopped");
    }

    /// Run the probe loop on a background task.
    pub fn spawn(
        self: Arc<Self>,
        monitor: ConnectivityMonitor,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(monitor, interval).await })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
