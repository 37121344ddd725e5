//! Dual-path statistics: store-native aggregates first, in-process fallback over recent rows,
//! memoized per query with a short TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::store::{with_timeout, CacheStore, EventStore};
use crate::types::{GroupLatency, StatRow, StatsPath, StatsQuery, StatsResult};

/// Picks one value out of ascending, non-empty samples for quantile `k` in `0..=1`.
pub type PercentileFn = fn(&[f64], f64) -> f64;

/// `sorted[floor(n * k)]`, clamped to the last element.
///
/// Not the textbook nearest-rank percentile: for `[100, 200, 300, 400]` the p50 is 300.
/// Kept as-is so fallback numbers match what dashboards have always shown.
pub fn percentile_at_rank(sorted: &[f64], k: f64) -> f64 {
  if sorted.is_empty() {
    return 0.0;
  }
  let n = sorted.len();
  let idx = (n as f64 * k).floor() as usize;
  sorted[idx.min(n - 1)]
}

/// Compute a full result from raw rows.
pub fn summarize(
  rows: &[StatRow],
  top_n: usize,
  percentile: PercentileFn,
  path: StatsPath,
) -> StatsResult {
  let n = rows.len();

  let mut by_group: BTreeMap<String, u64> = BTreeMap::new();
  // group -> (duration sum, duration count)
  let mut latency: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
  let mut durations: Vec<f64> = Vec::with_capacity(n);
  let mut error_count = 0u64;

  for row in rows {
    *by_group.entry(row.group.clone()).or_insert(0) += 1;
    if row.is_error {
      error_count += 1;
    }
    if let Some(d) = row.duration_ms {
      durations.push(d);
      let slot = latency.entry(row.group.as_str()).or_insert((0.0, 0));
      slot.0 += d;
      slot.1 += 1;
    }
  }

  durations.sort_by(f64::total_cmp);
  let (avg, p50, p95, p99) = if durations.is_empty() {
    (0.0, 0.0, 0.0, 0.0)
  } else {
    let sum: f64 = durations.iter().sum();
    (
      sum / durations.len() as f64,
      percentile(&durations, 0.5),
      percentile(&durations, 0.95),
      percentile(&durations, 0.99),
    )
  };

  let error_rate = if n == 0 {
    0
  } else {
    (error_count as f64 / n as f64 * 100.0).round() as u64
  };

  let rate_per_minute = match (
    rows.iter().map(|r| r.timestamp).min(),
    rows.iter().map(|r| r.timestamp).max(),
  ) {
    (Some(min), Some(max)) => {
      let span_ms = (max - min).num_milliseconds();
      if span_ms > 0 {
        (n as f64 / span_ms as f64 * 60_000.0).round() as u64
      } else {
        0
      }
    }
    _ => 0,
  };

  let mut top_groups: Vec<GroupLatency> = latency
    .into_iter()
    .map(|(group, (sum, count))| GroupLatency {
      group: group.to_string(),
      count,
      avg_ms: sum / count as f64,
    })
    .collect();
  // Slowest first, then group name for determinism.
  top_groups.sort_by(|a, b| {
    b.avg_ms
      .total_cmp(&a.avg_ms)
      .then_with(|| a.group.cmp(&b.group))
  });
  top_groups.truncate(top_n);

  StatsResult {
    total: n as u64,
    by_group,
    avg,
    p50,
    p95,
    p99,
    error_rate,
    rate_per_minute,
    top_groups,
    path,
  }
}

pub struct StatsAggregator {
  store: Arc<dyn EventStore>,
  cache: Arc<dyn CacheStore>,
  cache_ttl: Duration,
  sample_limit: usize,
  timeout: Duration,
  /// Bumped on every invalidation. A result computed under an older generation is not cached.
  generations: Mutex<HashMap<String, u64>>,
}

impl StatsAggregator {
  pub fn new(store: Arc<dyn EventStore>, cache: Arc<dyn CacheStore>, config: &Config) -> Self {
    Self {
      store,
      cache,
      cache_ttl: config.stats_cache_ttl(),
      sample_limit: config.stats_sample_limit,
      timeout: config.store_timeout(),
      generations: Mutex::new(HashMap::new()),
    }
  }

  /// Cached result if fresh, else fast path, else fallback. Errors only when both paths fail.
  #[instrument(skip(self, query), fields(project_id = %query.project_id, source = query.source.as_str()))]
  pub async fn compute_stats(&self, query: &StatsQuery) -> Result<StatsResult, EngineError> {
    let key = query.cache_key();
    if let Some(hit) = self.cached(&key).await {
      debug!("stats cache hit");
      return Ok(hit);
    }

    let generation = self.generation(&query.project_id).await;
    let result = self.compute_uncached(query).await?;
    self.remember(&query.project_id, generation, &key, &result).await;
    Ok(result)
  }

  /// Drop every memoized result for a project. Cache failures are logged, not raised.
  pub async fn invalidate_project(&self, project_id: &str) -> u64 {
    let prefix = StatsQuery::cache_prefix(project_id);
    let mut generations = self.generations.lock().await;
    *generations.entry(project_id.to_string()).or_default() += 1;
    match with_timeout(self.timeout, self.cache.delete_by_prefix(&prefix)).await {
      Ok(removed) => removed,
      Err(e) => {
        warn!(project_id, error = %e, "stats cache invalidation failed");
        0
      }
    }
  }

  async fn compute_uncached(&self, query: &StatsQuery) -> Result<StatsResult, EngineError> {
    let available = tokio::time::timeout(self.timeout, self.store.is_available())
      .await
      .unwrap_or(false);

    if available {
      match with_timeout(self.timeout, self.store.aggregate(query)).await {
        Ok(result) => return Ok(result),
        Err(e) => warn!(error = %e, "fast stats path failed; falling back to raw rows"),
      }
    } else {
      debug!("aggregate store unavailable; using fallback path");
    }

    let rows = with_timeout(self.timeout, self.store.query_rows(query, self.sample_limit)).await?;
    Ok(summarize(
      &rows,
      query.top_n,
      percentile_at_rank,
      StatsPath::Fallback,
    ))
  }

  async fn cached(&self, key: &str) -> Option<StatsResult> {
    let bytes = match with_timeout(self.timeout, self.cache.get(key)).await {
      Ok(hit) => hit?,
      Err(e) => {
        warn!(key, error = %e, "stats cache read failed; treating as miss");
        return None;
      }
    };
    match serde_json::from_slice(&bytes) {
      Ok(result) => Some(result),
      Err(e) => {
        warn!(key, error = %e, "undecodable stats cache entry; treating as miss");
        None
      }
    }
  }

  async fn generation(&self, project_id: &str) -> u64 {
    let generations = self.generations.lock().await;
    generations.get(project_id).copied().unwrap_or_default()
  }

  /// Cache `result` unless the project was invalidated after `generation` was read.
  /// Holds the generation lock across the write so an invalidation cannot interleave.
  async fn remember(&self, project_id: &str, generation: u64, key: &str, result: &StatsResult) {
    let bytes = match serde_json::to_vec(result) {
      Ok(b) => b,
      Err(e) => {
        warn!(key, error = %e, "failed to encode stats result for cache");
        return;
      }
    };
    let generations = self.generations.lock().await;
    if generations.get(project_id).copied().unwrap_or_default() != generation {
      debug!(key, "project invalidated while computing; not caching");
      return;
    }
    if let Err(e) = with_timeout(self.timeout, self.cache.set(key, &bytes, self.cache_ttl)).await {
      warn!(key, error = %e, "stats cache write failed");
    }
  }
}
