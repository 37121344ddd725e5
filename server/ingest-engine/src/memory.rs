//! In-process implementations of the collaborator traits.
//!
//! Used by the binary and the tests. Each store carries switches for simulating outages so
//! the fail-open and fallback paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::stats::summarize;
use crate::store::{CacheStore, CounterStore, EventStore};
use crate::types::{
  ConditionalInsert, Issue, IssueCounts, IssueId, IssueStatus, Occurrence, OccurrenceOutcome,
  StatRow, StatsPath, StatsQuery, StatsResult, StatsSource, StoredEvent, TraceRecord,
};

/// Linearly interpolated quantile, the way SQL `percentile_cont` computes it.
pub fn percentile_interpolated(sorted: &[f64], k: f64) -> f64 {
  if sorted.is_empty() {
    return 0.0;
  }
  let pos = (sorted.len() - 1) as f64 * k.clamp(0.0, 1.0);
  let lo = pos.floor() as usize;
  let hi = pos.ceil() as usize;
  sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

// ---------------------------------------------------------------------------
// Event store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EventData {
  issues: HashMap<IssueId, Issue>,
  /// Uniqueness index: (project_id, fingerprint_hash) -> issue.
  by_fingerprint: HashMap<(String, String), IssueId>,
  events: Vec<StoredEvent>,
  traces: Vec<TraceRecord>,
}

#[derive(Debug, Default)]
struct Switches {
  unavailable: AtomicBool,
  fail_aggregates: AtomicBool,
  fail_row_queries: AtomicBool,
  fail_writes: AtomicBool,
  fail_appends: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
  data: Arc<RwLock<EventData>>,
  switches: Arc<Switches>,
  aggregate_calls: Arc<AtomicUsize>,
  row_queries: Arc<AtomicUsize>,
}

impl MemoryEventStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether the store advertises native aggregates.
  pub fn set_available(&self, available: bool) {
    self.switches.unavailable.store(!available, Ordering::SeqCst);
  }

  pub fn fail_aggregates(&self, fail: bool) {
    self.switches.fail_aggregates.store(fail, Ordering::SeqCst);
  }

  pub fn fail_row_queries(&self, fail: bool) {
    self.switches.fail_row_queries.store(fail, Ordering::SeqCst);
  }

  pub fn fail_writes(&self, fail: bool) {
    self.switches.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Fail only event/trace appends; issue writes keep working.
  pub fn fail_appends(&self, fail: bool) {
    self.switches.fail_appends.store(fail, Ordering::SeqCst);
  }

  pub fn aggregate_calls(&self) -> usize {
    self.aggregate_calls.load(Ordering::SeqCst)
  }

  pub fn row_queries(&self) -> usize {
    self.row_queries.load(Ordering::SeqCst)
  }

  pub async fn issue_count(&self) -> usize {
    self.data.read().await.issues.len()
  }

  pub async fn event_count(&self) -> usize {
    self.data.read().await.events.len()
  }

  fn check_writable(&self) -> Result<(), StoreError> {
    if self.switches.fail_writes.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("writes disabled".into()));
    }
    Ok(())
  }

  fn check_appendable(&self) -> Result<(), StoreError> {
    self.check_writable()?;
    if self.switches.fail_appends.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("appends disabled".into()));
    }
    Ok(())
  }

  async fn matching_rows(&self, query: &StatsQuery) -> Vec<StatRow> {
    let data = self.data.read().await;
    let env_ok = |env: &Option<String>| match &query.filter.environment {
      Some(want) => env.as_deref() == Some(want.as_str()),
      None => true,
    };
    let group_ok = |group: &str| match &query.filter.group {
      Some(want) => group == want,
      None => true,
    };

    match query.source {
      StatsSource::Events => data
        .events
        .iter()
        .map(|s| &s.event)
        .filter(|e| e.project_id == query.project_id && query.range.contains(&e.timestamp))
        .filter(|e| env_ok(&e.environment) && group_ok(e.level.as_str()))
        .map(|e| StatRow {
          timestamp: e.timestamp,
          group: e.level.as_str().to_string(),
          duration_ms: None,
          is_error: e.level.is_error(),
        })
        .collect(),
      StatsSource::Traces => data
        .traces
        .iter()
        .filter(|t| t.project_id == query.project_id && query.range.contains(&t.timestamp))
        .filter(|t| env_ok(&t.environment) && group_ok(&t.name))
        .map(|t| StatRow {
          timestamp: t.timestamp,
          group: t.name.clone(),
          duration_ms: Some(t.duration_ms),
          is_error: t.is_error(),
        })
        .collect(),
    }
  }
}

#[async_trait]
impl EventStore for MemoryEventStore {
  async fn append_events(&self, events: &[StoredEvent]) -> Result<(), StoreError> {
    self.check_appendable()?;
    self.data.write().await.events.extend_from_slice(events);
    Ok(())
  }

  async fn append_traces(&self, traces: &[TraceRecord]) -> Result<(), StoreError> {
    self.check_appendable()?;
    self.data.write().await.traces.extend_from_slice(traces);
    Ok(())
  }

  async fn find_issue(
    &self,
    project_id: &str,
    fingerprint_hash: &str,
  ) -> Result<Option<Issue>, StoreError> {
    let data = self.data.read().await;
    let key = (project_id.to_string(), fingerprint_hash.to_string());
    Ok(
      data
        .by_fingerprint
        .get(&key)
        .and_then(|id| data.issues.get(id))
        .cloned(),
    )
  }

  async fn get_issue(&self, id: &IssueId) -> Result<Option<Issue>, StoreError> {
    Ok(self.data.read().await.issues.get(id).cloned())
  }

  async fn insert_issue(&self, issue: Issue) -> Result<ConditionalInsert, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    let key = (issue.project_id.clone(), issue.fingerprint_hash.clone());

    if let Some(existing) = data.by_fingerprint.get(&key).and_then(|id| data.issues.get(id)) {
      return Ok(ConditionalInsert::Existing(existing.clone()));
    }

    data.by_fingerprint.insert(key, issue.id.clone());
    data.issues.insert(issue.id.clone(), issue.clone());
    Ok(ConditionalInsert::Inserted(issue))
  }

  async fn record_occurrence(
    &self,
    id: &IssueId,
    occurrence: &Occurrence,
  ) -> Result<Option<OccurrenceOutcome>, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    let Some(issue) = data.issues.get_mut(id) else {
      return Ok(None);
    };

    let previous_status = issue.status;
    issue.event_count += 1;
    if occurrence.seen_at > issue.last_seen {
      issue.last_seen = occurrence.seen_at;
    }
    if let Some(env) = &occurrence.environment {
      issue.environments.insert(env.clone());
    }
    if let Some(release) = &occurrence.release {
      issue.releases.insert(release.clone());
    }
    if previous_status == IssueStatus::Resolved {
      issue.status = IssueStatus::Unresolved;
      issue.resolved_at = None;
    }

    Ok(Some(OccurrenceOutcome {
      issue: issue.clone(),
      previous_status,
    }))
  }

  async fn retract_occurrence(&self, id: &IssueId) -> Result<Option<u64>, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    let Some(issue) = data.issues.get_mut(id) else {
      return Ok(None);
    };
    issue.event_count = issue.event_count.saturating_sub(1);
    let remaining = issue.event_count;
    if remaining == 0 {
      if let Some(issue) = data.issues.remove(id) {
        let key = (issue.project_id, issue.fingerprint_hash);
        if data.by_fingerprint.get(&key) == Some(id) {
          data.by_fingerprint.remove(&key);
        }
      }
    }
    Ok(Some(remaining))
  }

  async fn set_status(
    &self,
    id: &IssueId,
    status: IssueStatus,
    resolved_at: Option<DateTime<Utc>>,
  ) -> Result<Option<Issue>, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    Ok(data.issues.get_mut(id).map(|issue| {
      issue.status = status;
      issue.resolved_at = resolved_at;
      issue.clone()
    }))
  }

  async fn set_counts(&self, id: &IssueId, counts: IssueCounts) -> Result<bool, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    Ok(match data.issues.get_mut(id) {
      Some(issue) => {
        issue.event_count = counts.events;
        issue.user_count = counts.users;
        true
      }
      None => false,
    })
  }

  async fn set_user_count(&self, id: &IssueId, users: u64) -> Result<bool, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    Ok(match data.issues.get_mut(id) {
      Some(issue) => {
        issue.user_count = users;
        true
      }
      None => false,
    })
  }

  async fn delete_issue(&self, id: &IssueId) -> Result<bool, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    let Some(issue) = data.issues.remove(id) else {
      return Ok(false);
    };
    let key = (issue.project_id, issue.fingerprint_hash);
    if data.by_fingerprint.get(&key) == Some(id) {
      data.by_fingerprint.remove(&key);
    }
    Ok(true)
  }

  async fn reassign_events(&self, from: &[IssueId], to: &IssueId) -> Result<u64, StoreError> {
    self.check_writable()?;
    let mut data = self.data.write().await;
    let mut moved = 0;
    for stored in data.events.iter_mut() {
      if from.contains(&stored.issue_id) {
        stored.issue_id = to.clone();
        moved += 1;
      }
    }
    Ok(moved)
  }

  async fn count_issue_events(&self, id: &IssueId) -> Result<IssueCounts, StoreError> {
    let data = self.data.read().await;
    let mut users = HashSet::new();
    let mut events = 0;
    for stored in data.events.iter().filter(|s| &s.issue_id == id) {
      events += 1;
      if let Some(user) = stored.event.user_id() {
        users.insert(user);
      }
    }
    Ok(IssueCounts {
      events,
      users: users.len() as u64,
    })
  }

  async fn query_rows(&self, query: &StatsQuery, limit: usize) -> Result<Vec<StatRow>, StoreError> {
    self.row_queries.fetch_add(1, Ordering::SeqCst);
    if self.switches.fail_row_queries.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("row queries disabled".into()));
    }
    let mut rows = self.matching_rows(query).await;
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    rows.truncate(limit);
    Ok(rows)
  }

  async fn aggregate(&self, query: &StatsQuery) -> Result<StatsResult, StoreError> {
    self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
    if self.switches.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("aggregates unavailable".into()));
    }
    if self.switches.fail_aggregates.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("aggregate query failed".into()));
    }
    let rows = self.matching_rows(query).await;
    Ok(summarize(
      &rows,
      query.top_n,
      percentile_interpolated,
      StatsPath::Fast,
    ))
  }

  async fn is_available(&self) -> bool {
    !self.switches.unavailable.load(Ordering::SeqCst)
  }
}

// ---------------------------------------------------------------------------
// Counter store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CounterEntry {
  value: u64,
  expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
  counters: Arc<Mutex<HashMap<String, CounterEntry>>>,
  failing: Arc<AtomicBool>,
}

impl MemoryCounterStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_all(&self, fail: bool) {
    self.failing.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
  async fn increment(&self, key: &str, window: Option<Duration>) -> Result<u64, StoreError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("counter store down".into()));
    }
    let mut counters = self.counters.lock().await;
    let now = Instant::now();
    // Windowed keys are never touched again once their window passes.
    counters.retain(|_, e| e.expires_at.map_or(true, |exp| now < exp));

    let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
      value: 0,
      expires_at: window.map(|w| now + w),
    });
    if entry.expires_at.is_some_and(|exp| now >= exp) {
      entry.value = 0;
      entry.expires_at = window.map(|w| now + w);
    }

    entry.value += 1;
    Ok(entry.value)
  }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
  value: Vec<u8>,
  expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
  data: Arc<RwLock<HashMap<String, CacheEntry>>>,
  failing: Arc<AtomicBool>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_all(&self, fail: bool) {
    self.failing.store(fail, Ordering::SeqCst);
  }

  fn check(&self) -> Result<(), StoreError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable("cache down".into()));
    }
    Ok(())
  }
}

#[async_trait]
impl CacheStore for MemoryCache {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    self.check()?;
    let data = self.data.read().await;
    match data.get(key) {
      Some(entry) if Instant::now() < entry.expires_at => Ok(Some(entry.value.clone())),
      Some(_) => {
        drop(data);
        self.data.write().await.remove(key);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
    self.check()?;
    let now = Instant::now();
    let mut data = self.data.write().await;
    data.retain(|_, e| now < e.expires_at);
    data.insert(
      key.to_string(),
      CacheEntry {
        value: value.to_vec(),
        expires_at: now + ttl,
      },
    );
    Ok(())
  }

  async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
    self.check()?;
    let mut data = self.data.write().await;
    let before = data.len();
    data.retain(|k, _| !k.starts_with(prefix));
    Ok((before - data.len()) as u64)
  }
}
