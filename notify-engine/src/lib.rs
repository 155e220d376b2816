//! notify-engine library crate.
//!
//! Multi-channel notification delivery: per-channel retries with
//! exponential backoff, circuit breaking, partial-success aggregation and a
//! batched, non-blocking audit pipeline with dead-letter fallback.

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notification;

pub use config::EngineConfig;
pub use error::{Error, Result};
