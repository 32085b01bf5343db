//! Request gateway: the single entry point for API calls.
//!
//! Outcome classification for mutating calls (POST/PATCH/DELETE):
//!
//! | situation                          | result                              |
//! |------------------------------------|-------------------------------------|
//! | offline at call time               | queued, `Delivery::Deferred`        |
//! | online, connection failure         | queued, `Delivery::Deferred`        |
//! | online, sent but no response       | `GatewayError::Transport`, not queued |
//! | online, server rejected / non-2xx  | `GatewayError::Application`, not queued |
//! | online, success envelope           | `Delivery::Applied(data)`           |
//!
//! GET calls always go to the network and never touch the queue. Only
//! requests addressed to the API's own origin are ever queued.

use std::sync::Arc;

use reqwest::Url;
use thiserror::Error;
use tradeflow_core::DomainError;

use crate::connectivity::ConnectivityMonitor;
use crate::queue::{JobQueue, QueueError};
use crate::transport::{RawResponse, Transport, TransportError, is_same_origin};
use crate::types::{Delivery, Envelope, Job, Placeholder, QueueEntry, Request};

/// Gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No response came back and the request was not queued.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered and rejected the request.
    #[error("{message}")]
    Application { status: u16, message: String },
    /// The request should have been queued but the queue refused it.
    #[error("failed to queue request: {0}")]
    Queue(#[from] QueueError),
    /// The request was malformed.
    #[error(transparent)]
    Invalid(#[from] DomainError),
    /// The response `data` did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_application(&self) -> bool {
        matches!(self, GatewayError::Application { .. })
    }
}

/// Entry point for every API call.
pub struct RequestGateway {
    queue: Arc<dyn JobQueue>,
    transport: Arc<dyn Transport>,
    monitor: ConnectivityMonitor,
    api_base: Option<Url>,
}

impl RequestGateway {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        transport: Arc<dyn Transport>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            queue,
            transport,
            monitor,
            api_base: None,
        }
    }

    /// Restrict queueing to endpoints on `base`'s origin.
    ///
    /// Without a base every endpoint counts as the API's own.
    pub fn with_api_base(mut self, base: Url) -> Self {
        self.api_base = Some(base);
        self
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Issue a request.
    pub async fn invoke(&self, request: Request) -> Result<Delivery, GatewayError> {
        if !request.verb.is_mutating() {
            let resp = self.transport.send(&request).await?;
            return interpret(resp).map(Delivery::Applied);
        }

        let job = Job::from_request(&request)?;
        let queueable = self.is_queueable(&request.endpoint);

        if self.monitor.is_offline() {
            if queueable {
                return self.defer(job, "offline").await;
            }
            tracing::warn!(
                endpoint = %request.endpoint,
                verb = %request.verb,
                "offline and endpoint is not on the API origin; not queued"
            );
            return Err(TransportError::Offline.into());
        }

        match self.transport.send(&request).await {
            Ok(resp) => interpret(resp).map(Delivery::Applied),
            Err(err) if queueable && err.is_unsent() => {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    verb = %request.verb,
                    error = %err,
                    "transport failure; queueing mutation"
                );
                self.defer(job, "transport_failure").await
            }
            Err(err) if queueable => {
                // The server may already have applied it; replaying could
                // write it twice.
                tracing::warn!(
                    endpoint = %request.endpoint,
                    verb = %request.verb,
                    error = %err,
                    "no response after sending; not queued"
                );
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn is_queueable(&self, endpoint: &str) -> bool {
        match &self.api_base {
            Some(base) => is_same_origin(base, endpoint),
            None => true,
        }
    }

    /// Persist the job, then hand back a placeholder.
    async fn defer(&self, job: Job, reason: &'static str) -> Result<Delivery, GatewayError> {
        let placeholder = Placeholder::for_job(job.id());
        let (job_id, endpoint, verb) = (job.id(), job.endpoint().to_string(), job.verb());

        self.queue.append(QueueEntry::new(job)).await.map_err(|err| {
            tracing::error!(job_id = %job_id, error = %err, "failed to persist queued mutation");
            GatewayError::Queue(err)
        })?;

        tracing::info!(
            job_id = %job_id,
            endpoint = %endpoint,
            verb = %verb,
            reason,
            "mutation queued for replay"
        );
        Ok(Delivery::Deferred(placeholder))
    }
}

/// Turn a server response into the envelope's `data` or an application error.
///
/// The error message is the envelope's `error`, else the raw body, else
/// `Request failed: <status>`.
pub fn interpret(resp: RawResponse) -> Result<serde_json::Value, GatewayError> {
    let envelope = Envelope::parse(&resp.body);

    if resp.is_success() {
        if let Some(Envelope { ok: true, data, .. }) = envelope {
            return Ok(data.unwrap_or(serde_json::Value::Null));
        }
    }

    let message = envelope
        .and_then(|e| e.error)
        .filter(|m| !m.is_empty())
        .or_else(|| (!resp.body.trim().is_empty()).then(|| resp.body.clone()))
        .unwrap_or_else(|| format!("Request failed: {}", resp.status));

    Err(GatewayError::Application {
        status: resp.status,
        message,
    })
}
