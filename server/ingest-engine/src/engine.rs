//! Core engine: wires collaborators together and runs the ingestion pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::fingerprint;
use crate::memory::{MemoryCache, MemoryCounterStore, MemoryEventStore};
use crate::normalize;
use crate::rate_limit::RateLimiter;
use crate::resolver::{EventMetadata, IssueResolver};
use crate::short_id::ShortIdSequencer;
use crate::stats::StatsAggregator;
use crate::store::{with_timeout, CacheStore, CounterStore, EventStore};
use crate::tasks::{Task, TaskQueue};
use crate::types::*;

/// Source of "now" for windowing and issue timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The ingestion & grouping engine. Cheap to share behind an `Arc`; every call is
/// independent and safe to run concurrently.
pub struct Engine {
  config: Config,
  store: Arc<dyn EventStore>,
  rate_limiter: RateLimiter,
  resolver: Arc<IssueResolver>,
  stats: Arc<StatsAggregator>,
  tasks: TaskQueue,
  clock: Clock,
}

impl Engine {
  /// Must be called inside a Tokio runtime (spawns the background worker).
  pub fn new(
    config: Config,
    store: Arc<dyn EventStore>,
    counters: Arc<dyn CounterStore>,
    cache: Arc<dyn CacheStore>,
  ) -> Self {
    let timeout = config.store_timeout();
    let rate_limiter = RateLimiter::new(counters.clone(), timeout);
    let sequencer = ShortIdSequencer::new(counters, timeout);
    let resolver = Arc::new(IssueResolver::new(store.clone(), sequencer, timeout));
    let stats = Arc::new(StatsAggregator::new(store.clone(), cache, &config));
    let (tasks, _worker) =
      TaskQueue::spawn(config.task_queue_capacity, stats.clone(), resolver.clone());

    Self {
      config,
      store,
      rate_limiter,
      resolver,
      stats,
      tasks,
      clock: Arc::new(Utc::now),
    }
  }

  /// Engine over fresh in-memory stores.
  pub fn in_memory(config: Config) -> Self {
    Self::new(
      config,
      Arc::new(MemoryEventStore::new()),
      Arc::new(MemoryCounterStore::new()),
      Arc::new(MemoryCache::new()),
    )
  }

  pub fn with_defaults() -> Self {
    Self::in_memory(Config::default())
  }

  pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Process a single inbound event for an already-resolved project.
  ///
  /// Rate limiting is advisory: an over-limit event is logged and still grouped and stored.
  /// Store failures on this path are returned to the caller.
  #[instrument(skip(self, raw), fields(event_id = %raw.event_id))]
  pub async fn ingest(
    &self,
    project_id: &str,
    raw: &IngestRequest,
  ) -> Result<IngestResult, EngineError> {
    let event = normalize::normalize(project_id, raw, self.config.max_breadcrumbs)?;
    let now = (self.clock)();

    let rate_limit = self.check_rate(project_id, "events", now).await;

    let fp = fingerprint::compute(
      &event,
      self.config.fingerprint_max_frames,
      &self.config.external_frame_markers,
    );
    let meta = EventMetadata::from_event(&event, now);
    let resolution = self.resolver.resolve(project_id, &fp, &meta).await?;

    let has_user = event.user_id().is_some();
    let stored = StoredEvent {
      event,
      issue_id: resolution.issue.id.clone(),
      fingerprint_hash: fp.hash.clone(),
    };
    let appended = with_timeout(
      self.config.store_timeout(),
      self.store.append_events(std::slice::from_ref(&stored)),
    )
    .await;
    if let Err(e) = appended {
      // The occurrence is already counted; take it back so counts track stored events.
      if let Err(undo) = self.resolver.retract(&resolution.issue.id).await {
        warn!(issue_id = %resolution.issue.id, error = %undo, "could not retract occurrence");
      }
      return Err(e.into());
    }

    self.tasks.enqueue(Task::InvalidateStats {
      project_id: project_id.to_string(),
    });
    if has_user {
      self.tasks.enqueue(Task::RefreshUserCount {
        issue_id: resolution.issue.id.clone(),
      });
    }

    Ok(IngestResult {
      event_id: stored.event.event_id,
      issue_id: resolution.issue.id,
      is_new_issue: resolution.is_new,
      regressed: resolution.regressed,
      fingerprint_hash: fp.hash,
      rate_limit,
    })
  }

  /// Validate and store one HTTP-trace span.
  #[instrument(skip(self, raw), fields(trace_id = %raw.trace_id))]
  pub async fn ingest_trace(
    &self,
    project_id: &str,
    raw: &TraceRequest,
  ) -> Result<RateLimitDecision, EngineError> {
    let record = normalize::normalize_trace(project_id, raw)?;
    let rate_limit = self.check_rate(project_id, "traces", (self.clock)()).await;

    with_timeout(
      self.config.store_timeout(),
      self.store.append_traces(std::slice::from_ref(&record)),
    )
    .await?;

    self.tasks.enqueue(Task::InvalidateStats {
      project_id: project_id.to_string(),
    });
    Ok(rate_limit)
  }

  /// Query with the configured top-N.
  pub fn stats_query(
    &self,
    project_id: &str,
    source: StatsSource,
    filter: StatsFilter,
    range: TimeRange,
  ) -> StatsQuery {
    StatsQuery {
      project_id: project_id.to_string(),
      source,
      filter,
      range,
      top_n: self.config.stats_top_groups,
    }
  }

  pub async fn compute_stats(&self, query: &StatsQuery) -> Result<StatsResult, EngineError> {
    self.stats.compute_stats(query).await
  }

  pub async fn merge_issues(
    &self,
    target: &IssueId,
    sources: &[IssueId],
  ) -> Result<MergeOutcome, EngineError> {
    self.resolver.merge(target, sources).await
  }

  pub async fn set_issue_status(
    &self,
    id: &IssueId,
    action: StatusAction,
  ) -> Result<Issue, EngineError> {
    self.resolver.set_status(id, action, (self.clock)()).await
  }

  pub async fn issue(&self, id: &IssueId) -> Result<Option<Issue>, EngineError> {
    Ok(with_timeout(self.config.store_timeout(), self.store.get_issue(id)).await?)
  }

  /// Wait for queued cache invalidations and user-count refreshes to finish.
  pub async fn flush_background(&self) {
    self.tasks.flush().await;
  }

  async fn check_rate(
    &self,
    project_id: &str,
    resource: &str,
    now: DateTime<Utc>,
  ) -> RateLimitDecision {
    let subject = format!("{}:{}", project_id, resource);
    let decision = self
      .rate_limiter
      .check_at(
        &subject,
        self.config.rate_limit,
        self.config.rate_limit_window_secs,
        now,
      )
      .await;
    if !decision.allowed {
      warn!(
        project_id,
        resource,
        limit = self.config.rate_limit,
        reset_in_secs = decision.reset_in_secs,
        "rate limit exceeded; accepting anyway"
      );
    }
    decision
  }
}
