//! Collaborator contracts consumed by the engine: event store, atomic counters, cache.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{
  ConditionalInsert, Issue, IssueCounts, IssueId, IssueStatus, Occurrence, OccurrenceOutcome,
  StatRow, StatsQuery, StatsResult, StoredEvent, TraceRecord,
};

#[async_trait]
pub trait EventStore: Send + Sync {
  async fn append_events(&self, events: &[StoredEvent]) -> Result<(), StoreError>;

  async fn append_traces(&self, traces: &[TraceRecord]) -> Result<(), StoreError>;

  async fn find_issue(
    &self,
    project_id: &str,
    fingerprint_hash: &str,
  ) -> Result<Option<Issue>, StoreError>;

  async fn get_issue(&self, id: &IssueId) -> Result<Option<Issue>, StoreError>;

  /// Insert unless an issue already holds `(project_id, fingerprint_hash)`; in that case
  /// nothing is written and the holder is returned.
  async fn insert_issue(&self, issue: Issue) -> Result<ConditionalInsert, StoreError>;

  /// Atomically count one more event against an issue: bump `event_count`, move
  /// `last_seen`, union environment/release, and flip RESOLVED back to UNRESOLVED.
  /// `None` when the issue no longer exists.
  async fn record_occurrence(
    &self,
    id: &IssueId,
    occurrence: &Occurrence,
  ) -> Result<Option<OccurrenceOutcome>, StoreError>;

  /// Undo one `record_occurrence` whose event never got stored: decrement `event_count`
  /// and remove the issue once it reaches zero. Returns the remaining count, `None` when
  /// the issue no longer exists.
  async fn retract_occurrence(&self, id: &IssueId) -> Result<Option<u64>, StoreError>;

  async fn set_status(
    &self,
    id: &IssueId,
    status: IssueStatus,
    resolved_at: Option<chrono::DateTime<chrono::Utc>>,
  ) -> Result<Option<Issue>, StoreError>;

  async fn set_counts(&self, id: &IssueId, counts: IssueCounts) -> Result<bool, StoreError>;

  async fn set_user_count(&self, id: &IssueId, users: u64) -> Result<bool, StoreError>;

  async fn delete_issue(&self, id: &IssueId) -> Result<bool, StoreError>;

  /// Repoint every event owned by `from` to `to`; returns how many moved.
  async fn reassign_events(&self, from: &[IssueId], to: &IssueId) -> Result<u64, StoreError>;

  /// Events and distinct users currently attributed to an issue.
  async fn count_issue_events(&self, id: &IssueId) -> Result<IssueCounts, StoreError>;

  /// Most recent rows matching the query, newest first, at most `limit`.
  async fn query_rows(&self, query: &StatsQuery, limit: usize) -> Result<Vec<StatRow>, StoreError>;

  /// Store-native aggregation. Counts are exact; percentiles may be approximate.
  async fn aggregate(&self, query: &StatsQuery) -> Result<StatsResult, StoreError>;

  async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait CounterStore: Send + Sync {
  /// Atomically add one and return the new value. With a window the key expires
  /// that long after its first increment.
  async fn increment(&self, key: &str, window: Option<Duration>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

  async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}

/// Bound a collaborator call.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
  F: Future<Output = Result<T, StoreError>>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(result) => result,
    Err(_) => Err(StoreError::Timeout),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn slow_call_times_out() {
    let slow = async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok::<_, StoreError>(1)
    };
    let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout));
  }

  #[tokio::test]
  async fn fast_call_passes_through() {
    let value = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
      .await
      .unwrap();
    assert_eq!(value, 7);
  }
}
