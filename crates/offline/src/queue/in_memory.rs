//! In-memory job queue for tests/dev.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tradeflow_core::JobId;

use super::{JobQueue, QueueError, merge_residue, push_dead_letters, restore_dead_letter};
use crate::types::{DeadLetter, QueueEntry};

#[derive(Debug, Default)]
struct State {
    pending: Vec<QueueEntry>,
    dead: Vec<DeadLetter>,
}

/// In-memory queue.
///
/// - No IO; contents vanish with the process
/// - Same ordering and residue semantics as the durable implementation
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Storage("in-memory queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn append(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.pending.iter().any(|e| e.id() == entry.id()) {
            return Err(QueueError::Duplicate(entry.id()));
        }
        state.pending.push(entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.lock()?.pending.clone())
    }

    async fn save(&self, remaining: Vec<QueueEntry>) -> Result<(), QueueError> {
        self.lock()?.pending = remaining;
        Ok(())
    }

    async fn save_residue(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let current = std::mem::take(&mut state.pending);
        state.pending = merge_residue(current, snapshot, remaining);
        Ok(())
    }

    async fn commit_pass(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
        dead: Vec<DeadLetter>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let current = std::mem::take(&mut state.pending);
        state.pending = merge_residue(current, snapshot, remaining);
        push_dead_letters(&mut state.dead, dead);
        Ok(())
    }

    async fn dead_letter(&self, letters: Vec<DeadLetter>) -> Result<(), QueueError> {
        push_dead_letters(&mut self.lock()?.dead, letters);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.lock()?.dead.clone())
    }

    async fn requeue_dead_letter(&self, id: JobId) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock()?;
        let State { pending, dead } = &mut *state;
        restore_dead_letter(pending, dead, id)
    }

    async fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let count = state.dead.len();
        state.dead.clear();
        Ok(count)
    }
}
