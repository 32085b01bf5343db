//! Connectivity tracking and flush triggers.
//!
//! [`ConnectivityMonitor`] is a pure event source: it does not talk to the
//! network itself. Platform signals (a health probe, an OS network callback,
//! the UI regaining focus) are fed in through `set_online`/`set_offline`/
//! `foregrounded`, and consumers subscribe to the resulting flush triggers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

pub use crate::types::ConnectivityState;

/// Capacity of the trigger channel. Slow subscribers skip ahead instead of
/// blocking the monitor.
const TRIGGER_CAPACITY: usize = 16;

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Drain jobs left over from a previous session.
    Startup,
    /// Transition from unreachable to reachable.
    Reconnected,
    /// The client regained foreground visibility.
    Foregrounded,
    /// Explicit request (e.g. a "sync now" button).
    Manual,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<ConnectivityState>,
    triggers: broadcast::Sender<TriggerReason>,
}

/// Shared connectivity state plus flush-trigger fan-out.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (triggers, _) = broadcast::channel(TRIGGER_CAPACITY);
        Self {
            inner: Arc::new(Inner { state, triggers }),
        }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Online)
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::Offline)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    /// Mark the API as reachable; raises `Reconnected` on an
    /// offline→online transition.
    pub fn set_online(&self) {
        let previous = self.inner.state.send_replace(ConnectivityState::Online);
        if previous == ConnectivityState::Offline {
            tracing::info!("connectivity restored");
            self.trigger(TriggerReason::Reconnected);
        }
    }

    /// Mark the API as unreachable.
    pub fn set_offline(&self) {
        let previous = self.inner.state.send_replace(ConnectivityState::Offline);
        if previous == ConnectivityState::Online {
            tracing::warn!("connectivity lost; mutations will be queued");
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if reachable {
            self.set_online();
        } else {
            self.set_offline();
        }
    }

    /// The client regained foreground visibility.
    pub fn foregrounded(&self) {
        self.trigger(TriggerReason::Foregrounded);
    }

    /// Raise a flush trigger explicitly.
    pub fn trigger(&self, reason: TriggerReason) {
        // No subscribers is fine: nobody is waiting to flush.
        let delivered = self.inner.triggers.send(reason).unwrap_or(0);
        tracing::debug!(?reason, subscribers = delivered, "flush trigger raised");
    }

    /// Subscribe to flush triggers raised after this call.
    pub fn subscribe(&self) -> TriggerSubscription {
        TriggerSubscription {
            receiver: self.inner.triggers.subscribe(),
        }
    }

    /// Run `callback` on a background task for every trigger raised after
    /// this call. The task ends when every monitor handle is dropped, or when
    /// the returned handle is aborted.
    pub fn on_trigger<F>(&self, mut callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(TriggerReason) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(reason) = subscription.recv().await {
                callback(reason);
            }
        })
    }

    /// Observe connectivity transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::online()
    }
}

/// A subscription to flush triggers.
#[derive(Debug)]
pub struct TriggerSubscription {
    receiver: broadcast::Receiver<TriggerReason>,
}

impl TriggerSubscription {
    /// Wait for the next trigger; `None` once the monitor is gone.
    ///
    /// Triggers missed by a lagging subscriber are skipped: one flush covers
    /// them all.
    pub async fn recv(&mut self) -> Option<TriggerReason> {
        loop {
            match self.receiver.recv().await {
                Ok(reason) => return Some(reason),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "trigger subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next pending trigger without waiting.
    pub fn try_recv(&mut self) -> Option<TriggerReason> {
        loop {
            match self.receiver.try_recv() {
                Ok(reason) => return Some(reason),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
