//! Stratus weather acquisition and caching core.
//!
//! Turns "give me weather for (lat, lon)" into a deduplicated, retried, and
//! cached result, usable online and offline, with a durable snapshot store
//! shared across processes.

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod types;

pub use cache::{CacheReader, SnapshotCache};
pub use coalesce::{CoalescerConfig, RequestCoalescer};
pub use config::FetchConfig;
pub use error::FetchError;
pub use orchestrator::{FetchOrchestrator, FetchPhase, ObservedState};
pub use provider::{OpenMeteoProvider, WeatherProvider};
pub use retry::{with_retry, RetryConfig};
pub use types::*;
