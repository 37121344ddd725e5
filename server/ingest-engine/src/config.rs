//! Engine configuration with sane defaults.

use std::time::Duration;

use crate::error::EngineError;

/// Tunable limits for ingestion, grouping and stats.
#[derive(Debug, Clone)]
pub struct Config {
  /// Max non-external stack frames to include in a fingerprint.
  pub fingerprint_max_frames: usize,
  /// Path fragments marking a frame as vendored/external (excluded from grouping).
  pub external_frame_markers: Vec<String>,
  /// Advisory event budget per project per window.
  pub rate_limit: u64,
  pub rate_limit_window_secs: u64,
  /// TTL for memoized stats results.
  pub stats_cache_ttl_secs: u64,
  /// Max raw rows fetched by the in-process stats fallback.
  pub stats_sample_limit: usize,
  /// How many slowest groups a stats result reports.
  pub stats_top_groups: usize,
  /// Upper bound on any single collaborator call.
  pub store_timeout_ms: u64,
  /// Breadcrumbs kept per event (most recent wins).
  pub max_breadcrumbs: usize,
  /// Capacity of the background task queue.
  pub task_queue_capacity: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      fingerprint_max_frames: 5,
      external_frame_markers: vec![
        "node_modules/".into(),
        "vendor/".into(),
        "site-packages/".into(),
        "dist-packages/".into(),
        ".cargo/registry/".into(),
      ],
      rate_limit: 10_000,
      rate_limit_window_secs: 60,
      stats_cache_ttl_secs: 30,
      stats_sample_limit: 10_000,
      stats_top_groups: 5,
      store_timeout_ms: 2_000,
      max_breadcrumbs: 100,
      task_queue_capacity: 1_024,
    }
  }
}

impl Config {
  /// Defaults overridden by `INGEST_*` environment variables.
  pub fn from_env() -> Result<Self, EngineError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
    let mut config = Self::default();

    if let Some(v) = lookup("INGEST_FINGERPRINT_MAX_FRAMES") {
      config.fingerprint_max_frames = parse("INGEST_FINGERPRINT_MAX_FRAMES", &v)?;
    }
    if let Some(v) = lookup("INGEST_EXTERNAL_FRAME_MARKERS") {
      config.external_frame_markers = v
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    }
    if let Some(v) = lookup("INGEST_RATE_LIMIT") {
      config.rate_limit = parse("INGEST_RATE_LIMIT", &v)?;
    }
    if let Some(v) = lookup("INGEST_RATE_LIMIT_WINDOW_SECS") {
      config.rate_limit_window_secs = parse("INGEST_RATE_LIMIT_WINDOW_SECS", &v)?;
      if config.rate_limit_window_secs == 0 {
        return Err(EngineError::config("INGEST_RATE_LIMIT_WINDOW_SECS", "must be > 0"));
      }
    }
    if let Some(v) = lookup("INGEST_STATS_CACHE_TTL_SECS") {
      config.stats_cache_ttl_secs = parse("INGEST_STATS_CACHE_TTL_SECS", &v)?;
    }
    if let Some(v) = lookup("INGEST_STATS_SAMPLE_LIMIT") {
      config.stats_sample_limit = parse("INGEST_STATS_SAMPLE_LIMIT", &v)?;
    }
    if let Some(v) = lookup("INGEST_STATS_TOP_GROUPS") {
      config.stats_top_groups = parse("INGEST_STATS_TOP_GROUPS", &v)?;
    }
    if let Some(v) = lookup("INGEST_STORE_TIMEOUT_MS") {
      config.store_timeout_ms = parse("INGEST_STORE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("INGEST_MAX_BREADCRUMBS") {
      config.max_breadcrumbs = parse("INGEST_MAX_BREADCRUMBS", &v)?;
    }
    if let Some(v) = lookup("INGEST_TASK_QUEUE_CAPACITY") {
      config.task_queue_capacity = parse("INGEST_TASK_QUEUE_CAPACITY", &v)?;
      if config.task_queue_capacity == 0 {
        return Err(EngineError::config("INGEST_TASK_QUEUE_CAPACITY", "must be > 0"));
      }
    }

    Ok(config)
  }

  pub fn store_timeout(&self) -> Duration {
    Duration::from_millis(self.store_timeout_ms)
  }

  pub fn stats_cache_ttl(&self) -> Duration {
    Duration::from_secs(self.stats_cache_ttl_secs)
  }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EngineError>
where
  T::Err: std::fmt::Display,
{
  value
    .trim()
    .parse()
    .map_err(|e: T::Err| EngineError::config(key, &e.to_string()))
}
