//! Find-or-create issues by fingerprint, detect regressions, merge and re-status issues.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::short_id::{self, ShortIdSequencer};
use crate::store::{with_timeout, EventStore};
use crate::types::*;

const TITLE_MAX_CHARS: usize = 200;

/// Per-event inputs the resolver needs beyond the fingerprint.
#[derive(Debug, Clone)]
pub struct EventMetadata {
  pub event_id: String,
  pub received_at: DateTime<Utc>,
  pub title: String,
  pub kind: IssueKind,
  pub level: Level,
  pub environment: Option<String>,
  pub release: Option<String>,
  pub stacktrace: Vec<StackFrame>,
}

impl EventMetadata {
  pub fn from_event(event: &Event, received_at: DateTime<Utc>) -> Self {
    let (title, kind, stacktrace) = match &event.exception {
      Some(exc) => {
        let ty = exc.exception_type.as_deref().unwrap_or("Error");
        let title = match exc.value.as_deref().filter(|v| !v.is_empty()) {
          Some(value) => format!("{}: {}", ty, value),
          None if !event.message.is_empty() => format!("{}: {}", ty, event.message),
          None => ty.to_string(),
        };
        (title, IssueKind::Error, exc.frames.clone())
      }
      None => {
        let first_line = event.message.lines().next().unwrap_or_default();
        (first_line.to_string(), IssueKind::Message, Vec::new())
      }
    };

    Self {
      event_id: event.event_id.clone(),
      received_at,
      title: truncate_chars(&title, TITLE_MAX_CHARS),
      kind,
      level: event.level,
      environment: event.environment.clone(),
      release: event.release.clone(),
      stacktrace,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Resolution {
  pub issue: Issue,
  pub is_new: bool,
  /// The issue was RESOLVED and this event reopened it.
  pub regressed: bool,
}

pub struct IssueResolver {
  store: Arc<dyn EventStore>,
  sequencer: ShortIdSequencer,
  timeout: Duration,
}

impl IssueResolver {
  pub fn new(store: Arc<dyn EventStore>, sequencer: ShortIdSequencer, timeout: Duration) -> Self {
    Self {
      store,
      sequencer,
      timeout,
    }
  }

  /// Attach one event to the issue for its fingerprint, creating the issue if needed.
  ///
  /// Creation is an insert guarded by the store's `(project_id, fingerprint_hash)`
  /// uniqueness; a caller that loses the race counts its event against the winner.
  #[instrument(skip(self, fingerprint, meta), fields(fingerprint_hash = %fingerprint.hash))]
  pub async fn resolve(
    &self,
    project_id: &str,
    fingerprint: &Fingerprint,
    meta: &EventMetadata,
  ) -> Result<Resolution, EngineError> {
    let existing = with_timeout(
      self.timeout,
      self.store.find_issue(project_id, &fingerprint.hash),
    )
    .await?;

    if let Some(issue) = existing {
      if let Some(resolution) = self.record(&issue.id, meta).await? {
        return Ok(resolution);
      }
      // Deleted between read and update; fall through and recreate.
      debug!(issue_id = %issue.id, "issue vanished before update; recreating");
    }

    let number = self.sequencer.next(project_id).await?;
    let candidate = new_issue(project_id, fingerprint, meta, number);

    match with_timeout(self.timeout, self.store.insert_issue(candidate)).await? {
      ConditionalInsert::Inserted(issue) => {
        info!(issue_id = %issue.id, short_id = %issue.short_id, "new issue");
        Ok(Resolution {
          issue,
          is_new: true,
          regressed: false,
        })
      }
      ConditionalInsert::Existing(winner) => {
        debug!(issue_id = %winner.id, "lost create race; joining existing issue");
        self.record(&winner.id, meta).await?.ok_or_else(|| {
          EngineError::not_found(format!("issue {} removed during resolution", winner.id))
        })
      }
    }
  }

  async fn record(
    &self,
    id: &IssueId,
    meta: &EventMetadata,
  ) -> Result<Option<Resolution>, EngineError> {
    let occurrence = Occurrence {
      seen_at: meta.received_at,
      environment: meta.environment.clone(),
      release: meta.release.clone(),
    };
    let outcome = with_timeout(self.timeout, self.store.record_occurrence(id, &occurrence)).await?;

    Ok(outcome.map(|outcome| {
      let regressed = outcome.previous_status == IssueStatus::Resolved;
      if regressed {
        info!(issue_id = %id, "regression: resolved issue received a new event");
      }
      Resolution {
        issue: outcome.issue,
        is_new: false,
        regressed,
      }
    }))
  }

  /// Fold `source_ids` into `target_id`. Safe to retry: sources already gone are skipped.
  #[instrument(skip(self, source_ids), fields(sources = source_ids.len()))]
  pub async fn merge(
    &self,
    target_id: &IssueId,
    source_ids: &[IssueId],
  ) -> Result<MergeOutcome, EngineError> {
    let target = with_timeout(self.timeout, self.store.get_issue(target_id))
      .await?
      .ok_or_else(|| EngineError::not_found(format!("issue {}", target_id)))?;

    let candidates: BTreeSet<&IssueId> = source_ids.iter().filter(|id| *id != target_id).collect();

    // Sources already deleted stay in the list so a retry still sweeps their events.
    let mut sources = Vec::with_capacity(candidates.len());
    for id in candidates {
      match with_timeout(self.timeout, self.store.get_issue(id)).await? {
        Some(source) if source.project_id != target.project_id => {
          warn!(source = %id, "skipping merge source from another project");
        }
        _ => sources.push(id.clone()),
      }
    }

    // Events move first so a failure below never strands them on a deleted issue.
    let events_moved = with_timeout(
      self.timeout,
      self.store.reassign_events(&sources, target_id),
    )
    .await?;

    let mut removed = Vec::with_capacity(sources.len());
    for id in &sources {
      if with_timeout(self.timeout, self.store.delete_issue(id)).await? {
        removed.push(id.clone());
      }
    }

    let counts = with_timeout(self.timeout, self.store.count_issue_events(target_id)).await?;
    with_timeout(self.timeout, self.store.set_counts(target_id, counts)).await?;

    info!(target = %target_id, removed = removed.len(), events_moved, "issues merged");
    Ok(MergeOutcome {
      target: target_id.clone(),
      removed,
      events_moved,
      event_count: counts.events,
      user_count: counts.users,
    })
  }

  /// Manual status change; see [`IssueStatus::apply`] for the allowed edges.
  pub async fn set_status(
    &self,
    id: &IssueId,
    action: StatusAction,
    now: DateTime<Utc>,
  ) -> Result<Issue, EngineError> {
    let issue = with_timeout(self.timeout, self.store.get_issue(id))
      .await?
      .ok_or_else(|| EngineError::not_found(format!("issue {}", id)))?;

    let status = issue.status.apply(action)?;
    let resolved_at = (status == IssueStatus::Resolved).then_some(now);

    with_timeout(self.timeout, self.store.set_status(id, status, resolved_at))
      .await?
      .ok_or_else(|| EngineError::not_found(format!("issue {}", id)))
  }

  /// Take back one counted event that was never stored. An issue left with no events is
  /// removed, so a retried ingest recreates it cleanly.
  pub async fn retract(&self, id: &IssueId) -> Result<Option<u64>, EngineError> {
    let remaining = with_timeout(self.timeout, self.store.retract_occurrence(id)).await?;
    if remaining == Some(0) {
      info!(issue_id = %id, "removed issue whose only event was not stored");
    }
    Ok(remaining)
  }

  /// Recount distinct users for an issue. Returns the new count.
  pub async fn refresh_user_count(&self, id: &IssueId) -> Result<u64, EngineError> {
    let counts = with_timeout(self.timeout, self.store.count_issue_events(id)).await?;
    with_timeout(self.timeout, self.store.set_user_count(id, counts.users)).await?;
    Ok(counts.users)
  }
}

fn new_issue(
  project_id: &str,
  fingerprint: &Fingerprint,
  meta: &EventMetadata,
  number: u64,
) -> Issue {
  Issue {
    id: IssueId::generate(),
    project_id: project_id.to_string(),
    fingerprint_hash: fingerprint.hash.clone(),
    short_id: short_id::format(number),
    title: meta.title.clone(),
    culprit: fingerprint.culprit.clone(),
    kind: meta.kind,
    level: meta.level,
    status: IssueStatus::Unresolved,
    resolved_at: None,
    first_seen: meta.received_at,
    last_seen: meta.received_at,
    event_count: 1,
    user_count: 0,
    environments: meta.environment.iter().cloned().collect(),
    releases: meta.release.iter().cloned().collect(),
    sample_event_id: meta.event_id.clone(),
    sample_stacktrace: meta.stacktrace.clone(),
  }
}

fn truncate_chars(s: &str, max: usize) -> String {
  match s.char_indices().nth(max) {
    Some((idx, _)) => format!("{}…", &s[..idx]),
    None => s.to_string(),
  }
}
