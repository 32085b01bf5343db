//! Replay engine: drains the durable queue against the network.
//!
//! A pass takes a snapshot of the queue, attempts each job once in enqueue
//! order, and commits the survivors and any dead letters together with
//! [`JobQueue::commit_pass`]. Jobs
//! appended while the pass runs are left for the next trigger.
//!
//! Only one pass runs at a time per engine. A `flush` that arrives while a
//! pass is in flight returns at once and schedules a single extra pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use tradeflow_core::JobId;

use crate::connectivity::ConnectivityMonitor;
use crate::queue::{JobQueue, QueueError};
use crate::transport::{RawResponse, Transport};
use crate::types::{DeadLetter, Envelope, QueueEntry};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// When a queued job stops being replayed.
///
/// The default keeps every job until it is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayPolicy {
    /// Dead-letter a job once this many attempts have failed.
    pub max_attempts: Option<u32>,
    /// Dead-letter a job older than this at the start of a pass.
    pub max_age: Option<Duration>,
}

impl ReplayPolicy {
    pub fn retain_forever() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Records without an enqueue timestamp never expire.
    fn expired(&self, entry: &QueueEntry, now: DateTime<Utc>) -> bool {
        match (self.max_age, entry.enqueued_at) {
            (Some(max_age), Some(enqueued_at)) => now
                .signed_duration_since(enqueued_at)
                .to_std()
                .is_ok_and(|age| age > max_age),
            _ => false,
        }
    }
}

/// Why a flush did not touch the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    Empty,
    /// Another flush was running; it will make one more pass.
    Coalesced,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Network calls made.
    pub attempted: usize,
    pub delivered: Vec<JobId>,
    /// Jobs that failed and stay queued.
    pub retained: Vec<JobId>,
    pub dead_lettered: Vec<JobId>,
    pub skipped: Option<SkipReason>,
}

impl FlushReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn coalesced() -> Self {
        Self::skipped(SkipReason::Coalesced)
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Fold a follow-up pass into this report.
    ///
    /// `retained` reflects the latest pass only.
    fn then(self, next: FlushReport) -> FlushReport {
        if next.is_skipped() {
            return self;
        }
        if self.is_skipped() {
            return next;
        }

        let mut delivered = self.delivered;
        delivered.extend(next.delivered);
        let mut dead_lettered = self.dead_lettered;
        dead_lettered.extend(next.dead_lettered);

        FlushReport {
            attempted: self.attempted + next.attempted,
            delivered,
            retained: next.retained,
            dead_lettered,
            skipped: None,
        }
    }
}

/// Clears the in-flight flag when a run ends, including on early return or
/// when the flush future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReplayEngine {
    queue: Arc<dyn JobQueue>,
    transport: Arc<dyn Transport>,
    monitor: ConnectivityMonitor,
    policy: ReplayPolicy,
    in_flight: AtomicBool,
    rerun: AtomicBool,
}

impl ReplayEngine {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        transport: Arc<dyn Transport>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            queue,
            transport,
            monitor,
            policy: ReplayPolicy::default(),
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: ReplayPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Replay every queued job once, in order.
    ///
    /// Safe to call from any number of triggers: concurrent calls coalesce
    /// into at most one extra pass after the running one.
    pub async fn flush(&self) -> Result<FlushReport, ReplayError> {
        self.rerun.store(true, Ordering::SeqCst);
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("flush already in flight; coalesced");
            return Ok(FlushReport::coalesced());
        }

        let mut report: Option<FlushReport> = None;
        loop {
            {
                let _in_flight = InFlight(&self.in_flight);
                while self.rerun.swap(false, Ordering::SeqCst) {
                    let pass = self.pass().await?;
                    report = Some(match report {
                        Some(prev) => prev.then(pass),
                        None => pass,
                    });
                }
            }
            // A trigger may have landed between the last check and the release.
            if !self.rerun.load(Ordering::SeqCst) || self.in_flight.swap(true, Ordering::SeqCst) {
                break;
            }
        }

        Ok(report.unwrap_or_else(FlushReport::coalesced))
    }

    async fn pass(&self) -> Result<FlushReport, ReplayError> {
        if self.monitor.is_offline() {
            debug!("offline; flush skipped");
            return Ok(FlushReport::skipped(SkipReason::Offline));
        }

        let snapshot = self.queue.list().await?;
        if snapshot.is_empty() {
            return Ok(FlushReport::skipped(SkipReason::Empty));
        }

        let snapshot_ids: Vec<JobId> = snapshot.iter().map(QueueEntry::id).collect();
        info!(jobs = snapshot.len(), "replaying queued mutations");

        let now = Utc::now();
        let mut report = FlushReport::default();
        let mut remaining = Vec::with_capacity(snapshot.len());
        let mut dead = Vec::new();

        for mut entry in snapshot {
            let job_id = entry.id();

            if self.policy.expired(&entry, now) {
                warn!(job_id = %job_id, endpoint = %entry.job.endpoint(), "queued mutation expired; dead-lettering");
                report.dead_lettered.push(job_id);
                dead.push(DeadLetter::new(entry, "expired"));
                continue;
            }

            report.attempted += 1;
            match self.attempt(&entry).await {
                Ok(()) => {
                    info!(
                        job_id = %job_id,
                        endpoint = %entry.job.endpoint(),
                        verb = %entry.job.verb(),
                        "queued mutation delivered"
                    );
                    report.delivered.push(job_id);
                }
                Err(reason) => {
                    entry.attempts = entry.attempts.saturating_add(1);
                    warn!(
                        job_id = %job_id,
                        endpoint = %entry.job.endpoint(),
                        verb = %entry.job.verb(),
                        attempts = entry.attempts,
                        reason = %reason,
                        "queued mutation failed; keeping it"
                    );
                    entry.last_error = Some(reason);

                    if self.policy.exhausted(entry.attempts) {
                        warn!(job_id = %job_id, attempts = entry.attempts, "retry limit reached; dead-lettering");
                        report.dead_lettered.push(job_id);
                        dead.push(DeadLetter::new(entry, "max attempts exceeded"));
                    } else {
                        report.retained.push(job_id);
                        remaining.push(entry);
                    }
                }
            }
        }

        self.queue.commit_pass(&snapshot_ids, remaining, dead).await?;

        info!(
            attempted = report.attempted,
            delivered = report.delivered.len(),
            retained = report.retained.len(),
            dead_lettered = report.dead_lettered.len(),
            "flush pass complete"
        );
        Ok(report)
    }

    /// One network call; `Err` carries the failure text recorded on the entry.
    async fn attempt(&self, entry: &QueueEntry) -> Result<(), String> {
        match self.transport.send(&entry.job.to_request()).await {
            Ok(resp) => delivery_outcome(&resp),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// 2xx and not an explicit failure envelope.
fn delivery_outcome(resp: &RawResponse) -> Result<(), String> {
    let envelope = Envelope::parse(&resp.body);
    if !resp.is_success() {
        let detail = envelope.and_then(|e| e.error);
        return Err(match detail {
            Some(message) => format!("HTTP {}: {message}", resp.status),
            None => format!("HTTP {}", resp.status),
        });
    }
    match envelope {
        Some(Envelope { ok: false, error, .. }) => {
            Err(error.unwrap_or_else(|| "request rejected".to_string()))
        }
        _ => Ok(()),
    }
}
