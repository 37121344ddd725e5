//! Bounded background queue for side effects that must not block ingestion:
//! stats cache invalidation and user-count refresh.
//!
//! Delivery is best effort. A full queue drops the task; stats then go stale for at most
//! one cache TTL and user counts until the issue's next event. A refresh for an issue that
//! already has one waiting is folded into the waiting one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::resolver::IssueResolver;
use crate::stats::StatsAggregator;
use crate::types::IssueId;

#[derive(Debug)]
pub enum Task {
  InvalidateStats { project_id: String },
  RefreshUserCount { issue_id: IssueId },
  /// Answered once every task queued before it has run.
  Flush(oneshot::Sender<()>),
}

/// Issues with a `RefreshUserCount` queued but not yet started.
type PendingRefreshes = Arc<Mutex<HashSet<IssueId>>>;

#[derive(Debug, Clone)]
pub struct TaskQueue {
  tx: mpsc::Sender<Task>,
  pending: PendingRefreshes,
}

impl TaskQueue {
  /// Start the worker. Must be called inside a Tokio runtime.
  pub fn spawn(
    capacity: usize,
    stats: Arc<StatsAggregator>,
    resolver: Arc<IssueResolver>,
  ) -> (Self, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = PendingRefreshes::default();
    let handle = tokio::spawn(run(rx, stats, resolver, pending.clone()));
    (Self { tx, pending }, handle)
  }

  /// Queue without waiting. Returns false when the task was dropped.
  pub fn enqueue(&self, task: Task) -> bool {
    if let Task::RefreshUserCount { issue_id } = &task {
      if !lock(&self.pending).insert(issue_id.clone()) {
        debug!(%issue_id, "user count refresh already queued");
        return true;
      }
    }
    match self.tx.try_send(task) {
      Ok(()) => true,
      Err(mpsc::error::TrySendError::Full(task)) => {
        warn!(?task, "background queue full; dropping task");
        self.forget(&task);
        false
      }
      Err(mpsc::error::TrySendError::Closed(task)) => {
        warn!(?task, "background worker stopped; dropping task");
        self.forget(&task);
        false
      }
    }
  }

  fn forget(&self, task: &Task) {
    if let Task::RefreshUserCount { issue_id } = task {
      lock(&self.pending).remove(issue_id);
    }
  }

  /// Wait until everything queued so far has been processed.
  pub async fn flush(&self) {
    let (done, wait) = oneshot::channel();
    if self.tx.send(Task::Flush(done)).await.is_ok() {
      let _ = wait.await;
    }
  }
}

/// The set is only touched for inserts and removes, so a poisoned lock still holds a usable set.
fn lock(pending: &PendingRefreshes) -> std::sync::MutexGuard<'_, HashSet<IssueId>> {
  pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(
  mut rx: mpsc::Receiver<Task>,
  stats: Arc<StatsAggregator>,
  resolver: Arc<IssueResolver>,
  pending: PendingRefreshes,
) {
  while let Some(task) = rx.recv().await {
    match task {
      Task::InvalidateStats { project_id } => {
        let removed = stats.invalidate_project(&project_id).await;
        debug!(project_id, removed, "stats cache invalidated");
      }
      Task::RefreshUserCount { issue_id } => {
        // Cleared before the recount so events arriving during it queue a fresh one.
        lock(&pending).remove(&issue_id);
        match resolver.refresh_user_count(&issue_id).await {
          Ok(users) => debug!(%issue_id, users, "user count refreshed"),
          Err(e) => warn!(%issue_id, error = %e, "user count refresh failed"),
        }
      }
      Task::Flush(done) => {
        let _ = done.send(());
      }
    }
  }
  debug!("background queue closed");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::memory::{MemoryCache, MemoryCounterStore, MemoryEventStore};
  use crate::short_id::ShortIdSequencer;
  use crate::store::CacheStore;
  use std::time::Duration;

  fn queue(cache: &MemoryCache, store: &MemoryEventStore) -> TaskQueue {
    let config = Config::default();
    let stats = Arc::new(StatsAggregator::new(
      Arc::new(store.clone()),
      Arc::new(cache.clone()),
      &config,
    ));
    let seq = ShortIdSequencer::new(Arc::new(MemoryCounterStore::new()), config.store_timeout());
    let resolver = Arc::new(IssueResolver::new(
      Arc::new(store.clone()),
      seq,
      config.store_timeout(),
    ));
    TaskQueue::spawn(8, stats, resolver).0
  }

  #[tokio::test]
  async fn invalidation_runs_before_flush_returns() {
    let cache = MemoryCache::new();
    let store = MemoryEventStore::new();
    cache.set("stats:p1:x", b"{}", Duration::from_secs(30)).await.unwrap();
    cache.set("stats:p2:x", b"{}", Duration::from_secs(30)).await.unwrap();

    let q = queue(&cache, &store);
    assert!(q.enqueue(Task::InvalidateStats {
      project_id: "p1".into()
    }));
    q.flush().await;

    assert!(cache.get("stats:p1:x").await.unwrap().is_none());
    assert!(cache.get("stats:p2:x").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn repeated_refreshes_for_one_issue_are_coalesced() {
    let cache = MemoryCache::new();
    let store = MemoryEventStore::new();
    let q = queue(&cache, &store);
    let id = IssueId("i-1".into());

    // The current-thread worker cannot run until this test yields.
    for _ in 0..5 {
      assert!(q.enqueue(Task::RefreshUserCount { issue_id: id.clone() }));
    }
    assert!(q.enqueue(Task::RefreshUserCount {
      issue_id: IssueId("i-2".into())
    }));
    assert_eq!(q.tx.max_capacity() - q.tx.capacity(), 2);

    q.flush().await;
    assert!(lock(&q.pending).is_empty());
    assert!(q.enqueue(Task::RefreshUserCount { issue_id: id }));
  }

  #[tokio::test]
  async fn refresh_of_missing_issue_is_harmless() {
    let cache = MemoryCache::new();
    let store = MemoryEventStore::new();
    let q = queue(&cache, &store);
    assert!(q.enqueue(Task::RefreshUserCount {
      issue_id: IssueId("gone".into())
    }));
    q.flush().await;
  }
}
