//! Shared types for the offline mutation pipeline.
//!
//! These are plain data types: they carry no IO and are used by the gateway,
//! the durable queue and the replay engine alike.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tradeflow_core::{DomainError, DomainResult, JobId, Verb};

/// Prefix marking identifiers that were generated locally for deferred writes.
pub const PLACEHOLDER_PREFIX: &str = "offline-";

/// Opaque request headers (merged on top of the transport defaults).
pub type Headers = BTreeMap<String, String>;

/// A request as issued by calling code.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub endpoint: String,
    pub verb: Verb,
    pub payload: Option<Value>,
    pub headers: Option<Headers>,
}

impl Request {
    pub fn new(endpoint: impl Into<String>, verb: Verb) -> Self {
        Self {
            endpoint: endpoint.into(),
            verb,
            payload: None,
            headers: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, Verb::Get)
    }

    pub fn post(endpoint: impl Into<String>, payload: Value) -> Self {
        Self::new(endpoint, Verb::Post).with_payload(payload)
    }

    pub fn patch(endpoint: impl Into<String>, payload: Value) -> Self {
        Self::new(endpoint, Verb::Patch).with_payload(payload)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, Verb::Delete)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.into(), value.into());
        self
    }
}

/// A single queued mutation.
///
/// Fields are private: a job is immutable once created. The only way to get
/// one is [`Job::from_request`] (validated) or deserializing a persisted
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    endpoint: String,
    verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<Headers>,
}

impl Job {
    /// Build a job for a mutating request, assigning a fresh id.
    pub fn from_request(request: &Request) -> DomainResult<Self> {
        if !request.verb.is_mutating() {
            return Err(DomainError::validation(format!(
                "{} requests are never queued",
                request.verb
            )));
        }
        if request.endpoint.trim().is_empty() {
            return Err(DomainError::validation("endpoint must not be empty"));
        }

        Ok(Self {
            id: JobId::new(),
            endpoint: request.endpoint.clone(),
            verb: request.verb,
            payload: request.payload.clone(),
            headers: request.headers.clone(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Rebuild the request this job replays.
    pub fn to_request(&self) -> Request {
        Request {
            endpoint: self.endpoint.clone(),
            verb: self.verb,
            payload: self.payload.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// A persisted queue record: the immutable job plus replay bookkeeping.
///
/// Serialized flat, so the stored layout is
/// `{id, endpoint, verb, payload?, headers?, attempts, enqueued_at?, last_error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub job: Job,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Absent on records written before timestamps were tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            attempts: 0,
            enqueued_at: Some(Utc::now()),
            last_error: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id()
    }
}

/// A job removed from replay after exceeding the retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(entry: QueueEntry, reason: impl Into<String>) -> Self {
        Self {
            entry,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Synthetic result returned when a mutation was deferred instead of applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub id: String,
    pub job_id: JobId,
}

impl Placeholder {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            id: format!("{PLACEHOLDER_PREFIX}{job_id}"),
            job_id,
        }
    }

    /// The value handed to callers in place of the server's `data`.
    pub fn to_value(&self) -> Value {
        json!({ "id": self.id })
    }
}

/// Whether an identifier was generated locally for a deferred write.
pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// Outcome of a successful gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The server accepted the request; carries the envelope's `data`.
    Applied(Value),
    /// The request was queued for later replay.
    Deferred(Placeholder),
}

impl Delivery {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Delivery::Deferred(_))
    }

    /// Server data, or the placeholder value for deferred writes.
    pub fn into_value(self) -> Value {
        match self {
            Delivery::Applied(data) => data,
            Delivery::Deferred(placeholder) => placeholder.to_value(),
        }
    }
}

/// Response envelope produced by the API: `{ok: true, data}` or
/// `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Envelope {
    /// Parse a response body; `None` when it is not an envelope.
    pub fn parse(body: &str) -> Option<Self> {
        if body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(body).ok()
    }
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The API is reachable.
    Online,
    /// Network unreachable or API unavailable.
    Offline,
}
