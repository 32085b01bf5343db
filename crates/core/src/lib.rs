//! `tradeflow-core`: shared building blocks for the offline mutation pipeline.
//!
//! This crate contains **pure** primitives (no IO, no async runtime).

pub mod error;
pub mod id;
pub mod verb;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use verb::Verb;
