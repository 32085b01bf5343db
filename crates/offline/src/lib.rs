//! `tradeflow-offline`
//!
//! **Responsibility:** Offline-resilient mutation pipeline for the trade
//! client.
//!
//! This crate provides:
//! - A request gateway every API call goes through; writes that cannot reach
//!   the server are queued and answered with a provisional `offline-` id
//! - A durable FIFO queue of pending writes (SQLite, or in-memory for tests)
//! - Connectivity tracking with flush triggers (reconnect, foreground, startup,
//!   manual)
//! - A replay engine that drains the queue in order, at least once
//! - Typed operations and a typed client for the catalog and trade endpoints
//!
//! Server rejections are never queued: they reach the caller as errors.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod gateway;
pub mod operations;
pub mod probe;
pub mod queue;
pub mod replay;
pub mod state;
pub mod transport;
pub mod types;
pub mod worker;

pub use client::{Receipt, TradeClient};
pub use config::{ConfigError, OfflineConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, TriggerReason};
pub use gateway::{GatewayError, RequestGateway};
pub use operations::Operation;
pub use probe::HealthProbe;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, SqliteJobQueue};
pub use replay::{FlushReport, ReplayEngine, ReplayError, ReplayPolicy, SkipReason};
pub use state::AppState;
pub use transport::{HttpTransport, Transport, TransportError};
pub use types::{Delivery, Job, Placeholder, QueueEntry, Request};
pub use worker::{SyncEvent, SyncWorker};
