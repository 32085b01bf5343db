//! Durable queue of pending mutation jobs.
//!
//! ## Contract
//!
//! - Order is insertion order (FIFO) and is significant.
//! - `list()` reads fresh from storage on every call; there is no long-lived
//!   cache, so independent handles observe the latest committed state.
//! - `append()` round-trips the full collection and commits with a
//!   compare-and-swap, so concurrent appends never clobber each other.
//! - `save_residue()` commits the outcome of a replay pass without dropping
//!   jobs appended while the pass was running.
//! - Operations that touch both the pending and the dead-letter record
//!   (`commit_pass`, `requeue_dead_letter`) change both or neither.
//! - A record that cannot be parsed is reported as [`QueueError::Corrupted`],
//!   never silently treated as empty.
//!
//! ## Implementations
//!
//! - [`InMemoryJobQueue`]: tests/dev
//! - [`SqliteJobQueue`]: key-value table in a local SQLite database

pub mod in_memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use tradeflow_core::JobId;

use crate::types::{DeadLetter, QueueEntry};

pub use in_memory::InMemoryJobQueue;
pub use sqlite::SqliteJobQueue;

/// Namespaced key of the pending-jobs record.
pub const JOBS_KEY: &str = "__offline_jobs__";

/// Namespaced key of the dead-letter record.
pub const DEAD_LETTERS_KEY: &str = "__offline_jobs__:dead";

/// Durable queue error.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job already queued: {0}")]
    Duplicate(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("queue record '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable, ordered store of pending jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job at the tail.
    async fn append(&self, entry: QueueEntry) -> Result<(), QueueError>;

    /// Ordered snapshot of the pending jobs.
    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// Overwrite the pending list wholesale.
    async fn save(&self, remaining: Vec<QueueEntry>) -> Result<(), QueueError>;

    /// Commit the outcome of a replay pass.
    ///
    /// `snapshot` holds the ids the pass started from and `remaining` the ones
    /// it kept. Jobs appended after the snapshot are preserved at the tail.
    async fn save_residue(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
    ) -> Result<(), QueueError>;

    /// Commit a replay pass: the residue (as in `save_residue`) together with
    /// the jobs it dead-lettered. Both records change or neither does.
    async fn commit_pass(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
        dead: Vec<DeadLetter>,
    ) -> Result<(), QueueError>;

    /// Number of pending jobs.
    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.list().await?.len())
    }

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Add jobs to the dead-letter record.
    async fn dead_letter(&self, letters: Vec<DeadLetter>) -> Result<(), QueueError>;

    /// List dead-lettered jobs (oldest first).
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Move a dead-lettered job back to the tail of the pending list with its
    /// attempt count reset. Both records change or neither does.
    async fn requeue_dead_letter(&self, id: JobId) -> Result<QueueEntry, QueueError>;

    /// Drop every dead letter; returns how many were removed.
    async fn purge_dead_letters(&self) -> Result<usize, QueueError>;
}

/// Merge the residue of a replay pass with the current stored list.
///
/// - kept jobs that are still stored come first, in the pass's order
///   (carrying their updated bookkeeping)
/// - jobs stored but unknown to the pass (appended meanwhile) follow, in
///   stored order
/// - kept jobs that disappeared from storage (handled elsewhere) are dropped
pub(crate) fn merge_residue(
    current: Vec<QueueEntry>,
    snapshot: &[JobId],
    remaining: Vec<QueueEntry>,
) -> Vec<QueueEntry> {
    let stored: HashSet<JobId> = current.iter().map(QueueEntry::id).collect();
    let seen: HashSet<JobId> = snapshot.iter().copied().collect();

    let mut merged: Vec<QueueEntry> = remaining
        .into_iter()
        .filter(|e| stored.contains(&e.id()))
        .collect();
    merged.extend(current.into_iter().filter(|e| !seen.contains(&e.id())));
    merged
}

/// Add `letters`, replacing any older letter for the same job.
pub(crate) fn push_dead_letters(dead: &mut Vec<DeadLetter>, letters: Vec<DeadLetter>) {
    for letter in letters {
        let id = letter.entry.id();
        dead.retain(|d| d.entry.id() != id);
        dead.push(letter);
    }
}

/// Take job `id` out of `dead` and append it to `pending` with its
/// bookkeeping reset. A job already pending is not appended twice.
pub(crate) fn restore_dead_letter(
    pending: &mut Vec<QueueEntry>,
    dead: &mut Vec<DeadLetter>,
    id: JobId,
) -> Result<QueueEntry, QueueError> {
    let pos = dead
        .iter()
        .position(|d| d.entry.id() == id)
        .ok_or(QueueError::NotFound(id))?;

    let mut entry = dead.remove(pos).entry;
    entry.attempts = 0;
    entry.last_error = None;
    if !pending.iter().any(|e| e.id() == id) {
        pending.push(entry.clone());
    }
    Ok(entry)
}

/// Parse a stored JSON list; an absent or blank record is an empty list.
pub(crate) fn decode_list<T: serde::de::DeserializeOwned>(
    key: &str,
    raw: Option<&str>,
) -> Result<Vec<T>, QueueError> {
    match raw {
        None => Ok(Vec::new()),
        Some(text) if text.trim().is_empty() => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text).map_err(|e| {
            tracing::error!(key, error = %e, "queue record failed to parse");
            QueueError::Corrupted {
                key: key.to_string(),
                reason: e.to_string(),
            }
        }),
    }
}

pub(crate) fn encode_list<T: serde::Serialize>(items: &[T]) -> Result<String, QueueError> {
    serde_json::to_string(items).map_err(|e| QueueError::Storage(format!("encode failed: {e}")))
}
