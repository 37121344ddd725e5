//! Ingestion & grouping engine for error, log and HTTP-trace telemetry.
//!
//! Fingerprints error events, deduplicates them into issues (with regression detection
//! and merges), applies advisory per-project rate limits, and serves dual-path stats
//! (store-native aggregates with an in-process fallback) behind a short-TTL cache.
//!
//! Durable storage, atomic counters and caching are collaborator traits in [`store`];
//! [`memory`] provides in-process versions.

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod normalize;
pub mod rate_limit;
pub mod resolver;
pub mod short_id;
pub mod stats;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, StoreError};
pub use types::{IngestRequest, IngestResponse, IngestResult, Issue, StatsResult};
