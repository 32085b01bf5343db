//! Network seam of the pipeline.
//!
//! Everything that talks to the API goes through [`Transport`]. The HTTP
//! implementation is backed by `reqwest`; [`ScriptedTransport`] is an
//! in-process double for tests and demos.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;

use crate::types::Request;

/// A response that made it back from the server, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// No response came back from the server.
///
/// Only [`TransportError::Offline`] and [`TransportError::Connect`] guarantee
/// the server never saw the request; the other variants fail after it may
/// have been sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("client is offline")]
    Offline,
    /// The connection could not be established (refused, DNS, connect
    /// timeout).
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request was sent but no response arrived in time.
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Io(String),
}

impl TransportError {
    /// The request certainly never reached the server, so it is safe to
    /// send it again later.
    pub fn is_unsent(&self) -> bool {
        matches!(self, TransportError::Offline | TransportError::Connect(_))
    }
}

/// Sends a request and returns the raw server response.
///
/// Implementations must return `Err` only when no response was received;
/// any HTTP status (including 4xx/5xx) is an `Ok(RawResponse)`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        (**self).send(request).await
    }
}

/// HTTP transport against the tradeflow API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpTransport {
    /// `timeout` bounds both the connect phase and the whole request.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid API base URL '{base_url}'"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an endpoint (relative path or absolute URL) against the base URL.
    pub fn resolve(&self, endpoint: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(endpoint)
            .map_err(|e| TransportError::Io(format!("invalid endpoint '{endpoint}': {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        let url = self.resolve(&request.endpoint)?;
        let method = reqwest::Method::from_bytes(request.verb.as_str().as_bytes())
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if let Some(payload) = &request.payload {
            req = req.json(payload);
        }

        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status().as_u16();

        // The server answered; an unreadable body is not a transport failure.
        let body = match resp.text().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(status, error = %err, "failed to read response body");
                String::new()
            }
        };

        Ok(RawResponse { status, body })
    }
}

/// Connect-phase failures (including connect timeouts) come first: they are
/// the only ones where the request was never written.
fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

/// Whether `endpoint`, resolved against `base`, targets `base`'s origin.
///
/// Endpoints that do not resolve are not same-origin.
pub fn is_same_origin(base: &Url, endpoint: &str) -> bool {
    base.join(endpoint)
        .is_ok_and(|url| url.origin() == base.origin())
}

/// One recorded call made against a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub endpoint: String,
    pub verb: tradeflow_core::Verb,
    pub payload: Option<serde_json::Value>,
}

/// In-process transport for tests/dev.
///
/// Replies are consumed in call order; once the script is exhausted every
/// call gets the fallback reply (a success envelope unless changed). Every
/// call is recorded.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    fallback: Mutex<Result<RawResponse, TransportError>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(Self::ok_envelope(serde_json::json!({})))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// A transport on which every call fails as unreachable.
    pub fn unreachable() -> Self {
        let transport = Self::new();
        transport.set_fallback(Err(TransportError::Connect("network unreachable".into())));
        transport
    }

    /// `200 {"ok": true, "data": data}`.
    pub fn ok_envelope(data: serde_json::Value) -> RawResponse {
        RawResponse::new(
            200,
            serde_json::json!({ "ok": true, "data": data }).to_string(),
        )
    }

    /// `status {"ok": false, "error": message}`.
    pub fn error_envelope(status: u16, message: &str) -> RawResponse {
        RawResponse::new(
            status,
            serde_json::json!({ "ok": false, "error": message }).to_string(),
        )
    }

    /// Queue the reply for the next unanswered call.
    pub fn push(&self, reply: Result<RawResponse, TransportError>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
    }

    pub fn set_fallback(&self, reply: Result<RawResponse, TransportError>) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = reply;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedCall {
            endpoint: request.endpoint.clone(),
            verb: request.verb,
            payload: request.payload.clone(),
        });

        let scripted = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match scripted {
            Some(reply) => reply,
            None => self.fallback.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}
