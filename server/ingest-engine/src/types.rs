//! Core types for the ingestion engine (JSON contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Inbound types (JSON contract: what SDKs send)
// ---------------------------------------------------------------------------

/// One inbound error/log event. Unknown fields are silently ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
  pub event_id: String,
  pub timestamp: String,
  pub level: String,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub exception: Option<InboundException>,
  #[serde(default)]
  pub breadcrumbs: Vec<Breadcrumb>,
  #[serde(default)]
  pub contexts: BTreeMap<String, serde_json::Value>,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
  #[serde(default)]
  pub environment: Option<String>,
  #[serde(default)]
  pub release: Option<String>,
  #[serde(default)]
  pub server_name: Option<String>,
  #[serde(default)]
  pub request_id: Option<String>,
  #[serde(default)]
  pub transaction_id: Option<String>,
  /// Caller-supplied grouping override.
  #[serde(default)]
  pub fingerprint: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundException {
  #[serde(rename = "type", default)]
  pub exception_type: Option<String>,
  #[serde(default)]
  pub value: Option<String>,
  #[serde(default)]
  pub stacktrace: Vec<InboundFrame>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
  #[serde(default)]
  pub filename: Option<String>,
  #[serde(default)]
  pub function: Option<String>,
  #[serde(default)]
  pub lineno: Option<u32>,
  #[serde(default)]
  pub colno: Option<u32>,
  #[serde(default)]
  pub context_line: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub level: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<serde_json::Value>,
}

/// One inbound HTTP-trace span.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRequest {
  pub trace_id: String,
  pub name: String,
  pub timestamp: String,
  pub duration_ms: f64,
  #[serde(default)]
  pub status_code: Option<u16>,
  #[serde(default)]
  pub environment: Option<String>,
}

/// Line format accepted by the binary: an event tagged with its resolved project.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEnvelope {
  pub project_id: String,
  pub event: IngestRequest,
}

// ---------------------------------------------------------------------------
// Level enum (normalized)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
  Debug,
  Info,
  Warning,
  Error,
  Fatal,
}

impl Level {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "debug" | "trace" => Some(Self::Debug),
      "info" | "log" => Some(Self::Info),
      "warning" | "warn" => Some(Self::Warning),
      "error" | "err" => Some(Self::Error),
      "fatal" | "critical" | "crit" => Some(Self::Fatal),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Debug => "debug",
      Self::Info => "info",
      Self::Warning => "warning",
      Self::Error => "error",
      Self::Fatal => "fatal",
    }
  }

  pub fn is_error(self) -> bool {
    self >= Self::Error
  }
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
  pub filename: String,
  pub function: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub column: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
  pub exception_type: Option<String>,
  pub value: Option<String>,
  /// Call order as reported by the SDK.
  pub frames: Vec<StackFrame>,
}

/// Canonical internal event after normalization + validation. Never mutated.
#[derive(Debug, Clone)]
pub struct Event {
  pub event_id: String,
  pub project_id: String,
  pub timestamp: DateTime<Utc>,
  pub level: Level,
  pub message: String,
  /// `None` marks a message-only event.
  pub exception: Option<Exception>,
  pub breadcrumbs: Vec<Breadcrumb>,
  pub contexts: BTreeMap<String, serde_json::Value>,
  pub tags: BTreeMap<String, String>,
  pub environment: Option<String>,
  pub release: Option<String>,
  pub server_name: Option<String>,
  pub request_id: Option<String>,
  pub transaction_id: Option<String>,
  pub fingerprint_override: Option<Vec<String>>,
}

impl Event {
  /// `contexts.user.id`, accepting string or numeric ids.
  pub fn user_id(&self) -> Option<String> {
    match self.contexts.get("user")?.get("id")? {
      serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
      serde_json::Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }
}

/// An event as owned by the event store, attributed to an issue.
#[derive(Debug, Clone)]
pub struct StoredEvent {
  pub event: Event,
  pub issue_id: IssueId,
  pub fingerprint_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
  pub trace_id: String,
  pub project_id: String,
  pub name: String,
  pub timestamp: DateTime<Utc>,
  pub duration_ms: f64,
  pub status_code: Option<u16>,
  pub environment: Option<String>,
}

impl TraceRecord {
  pub fn is_error(&self) -> bool {
    self.status_code.is_some_and(|s| s >= 500)
  }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Ordered grouping tokens plus their content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
  pub tokens: Vec<String>,
  pub hash: String,
  pub culprit: Option<String>,
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId(pub String);

impl IssueId {
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }
}

impl fmt::Display for IssueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
  Unresolved,
  Resolved,
  Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAction {
  Resolve,
  Reopen,
  Ignore,
  Unignore,
}

impl IssueStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Unresolved => "unresolved",
      Self::Resolved => "resolved",
      Self::Ignored => "ignored",
    }
  }

  /// `UNRESOLVED <-> RESOLVED` and `UNRESOLVED <-> IGNORED`; nothing else.
  pub fn apply(self, action: StatusAction) -> Result<Self, EngineError> {
    match (self, action) {
      (Self::Unresolved, StatusAction::Resolve) => Ok(Self::Resolved),
      (Self::Resolved, StatusAction::Reopen) => Ok(Self::Unresolved),
      (Self::Unresolved, StatusAction::Ignore) => Ok(Self::Ignored),
      (Self::Ignored, StatusAction::Unignore) => Ok(Self::Unresolved),
      (from, action) => Err(EngineError::InvalidTransition {
        from: from.as_str().to_string(),
        action: action.as_str().to_string(),
      }),
    }
  }
}

impl StatusAction {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Resolve => "resolve",
      Self::Reopen => "reopen",
      Self::Ignore => "ignore",
      Self::Unignore => "unignore",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
  Error,
  Message,
}

/// Deduplicated aggregate of all events sharing a fingerprint within a project.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
  pub id: IssueId,
  pub project_id: String,
  pub fingerprint_hash: String,
  pub short_id: String,
  pub title: String,
  pub culprit: Option<String>,
  #[serde(rename = "type")]
  pub kind: IssueKind,
  pub level: Level,
  pub status: IssueStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
  pub first_seen: DateTime<Utc>,
  pub last_seen: DateTime<Utc>,
  pub event_count: u64,
  pub user_count: u64,
  pub environments: BTreeSet<String>,
  pub releases: BTreeSet<String>,
  pub sample_event_id: String,
  pub sample_stacktrace: Vec<StackFrame>,
}

/// One more matching event, as applied to an existing issue.
#[derive(Debug, Clone)]
pub struct Occurrence {
  pub seen_at: DateTime<Utc>,
  pub environment: Option<String>,
  pub release: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OccurrenceOutcome {
  pub issue: Issue,
  pub previous_status: IssueStatus,
}

/// Result of an insert guarded by the `(project_id, fingerprint_hash)` uniqueness key.
#[derive(Debug, Clone)]
pub enum ConditionalInsert {
  Inserted(Issue),
  Existing(Issue),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueCounts {
  pub events: u64,
  pub users: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
  pub target: IssueId,
  pub removed: Vec<IssueId>,
  pub events_moved: u64,
  pub event_count: u64,
  pub user_count: u64,
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
  pub allowed: bool,
  pub remaining: u64,
  pub reset_in_secs: u64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
  /// Error/log events, grouped by level.
  Events,
  /// HTTP-trace spans, grouped by span name.
  Traces,
}

impl StatsSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Events => "events",
      Self::Traces => "traces",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StatsFilter {
  pub environment: Option<String>,
  pub group: Option<String>,
}

/// Half-open `[start, end)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

impl TimeRange {
  pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
    *ts >= self.start && *ts < self.end
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatsQuery {
  pub project_id: String,
  pub source: StatsSource,
  pub filter: StatsFilter,
  pub range: TimeRange,
  pub top_n: usize,
}

impl StatsQuery {
  /// Every cache key for a project starts with this.
  pub fn cache_prefix(project_id: &str) -> String {
    format!("stats:{}:", project_id)
  }

  /// Project prefix, source, then a blake3 digest of the remaining parameters. Each filter is
  /// tagged present/absent and length-prefixed, so no two distinct queries share a key.
  pub fn cache_key(&self) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [&self.filter.environment, &self.filter.group] {
      match part {
        Some(value) => {
          hasher.update(b"\x01");
          hasher.update(&(value.len() as u64).to_le_bytes());
          hasher.update(value.as_bytes());
        }
        None => {
          hasher.update(b"\x00");
        }
      }
    }
    hasher.update(&self.range.start.timestamp_millis().to_le_bytes());
    hasher.update(&self.range.end.timestamp_millis().to_le_bytes());
    hasher.update(&(self.top_n as u64).to_le_bytes());

    format!(
      "{}{}:{}",
      Self::cache_prefix(&self.project_id),
      self.source.as_str(),
      hasher.finalize().to_hex()
    )
  }
}

/// Flat row the in-process fallback computes over.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRow {
  pub timestamp: DateTime<Utc>,
  pub group: String,
  pub duration_ms: Option<f64>,
  pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLatency {
  pub group: String,
  pub count: u64,
  pub avg_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsPath {
  Fast,
  Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
  pub total: u64,
  pub by_group: BTreeMap<String, u64>,
  pub avg: f64,
  pub p50: f64,
  pub p95: f64,
  pub p99: f64,
  /// Percent, rounded.
  pub error_rate: u64,
  pub rate_per_minute: u64,
  pub top_groups: Vec<GroupLatency>,
  pub path: StatsPath,
}

// ---------------------------------------------------------------------------
// Output types (JSON contract: what we emit)
// ---------------------------------------------------------------------------

/// Full outcome of one ingestion, including the out-of-band regression flag.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
  pub event_id: String,
  pub issue_id: IssueId,
  pub is_new_issue: bool,
  pub regressed: bool,
  pub fingerprint_hash: String,
  pub rate_limit: RateLimitDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
  pub event_id: String,
  pub issue_id: IssueId,
  pub is_new_issue: bool,
}

impl From<&IngestResult> for IngestResponse {
  fn from(result: &IngestResult) -> Self {
    Self {
      event_id: result.event_id.clone(),
      issue_id: result.issue_id.clone(),
      is_new_issue: result.is_new_issue,
    }
  }
}

/// Structured error output for rejected input lines.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn status_machine_allows_documented_edges() {
    use IssueStatus::*;
    use StatusAction::*;
    assert_eq!(Unresolved.apply(Resolve).unwrap(), Resolved);
    assert_eq!(Resolved.apply(Reopen).unwrap(), Unresolved);
    assert_eq!(Unresolved.apply(Ignore).unwrap(), Ignored);
    assert_eq!(Ignored.apply(Unignore).unwrap(), Unresolved);
  }

  #[test]
  fn status_machine_rejects_other_edges() {
    use IssueStatus::*;
    use StatusAction::*;
    assert!(Resolved.apply(Ignore).is_err());
    assert!(Ignored.apply(Resolve).is_err());
    let err = Unresolved.apply(Reopen).unwrap_err();
    assert!(err.to_string().contains("reopen"));
  }

  #[test]
  fn level_parsing_is_loose() {
    assert_eq!(Level::from_str_loose("WARN"), Some(Level::Warning));
    assert_eq!(Level::from_str_loose("critical"), Some(Level::Fatal));
    assert_eq!(Level::from_str_loose("verbose"), None);
    assert!(Level::Fatal.is_error());
    assert!(!Level::Warning.is_error());
  }

  #[test]
  fn cache_keys_share_project_prefix() {
    let start = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
    let query = StatsQuery {
      project_id: "p1".into(),
      source: StatsSource::Traces,
      filter: StatsFilter {
        environment: Some("prod".into()),
        group: None,
      },
      range: TimeRange {
        start,
        end: start + chrono::Duration::hours(1),
      },
      top_n: 5,
    };
    let key = query.cache_key();
    assert!(key.starts_with(&StatsQuery::cache_prefix("p1")));
    assert!(!key.starts_with(&StatsQuery::cache_prefix("p")));
    assert!(key.starts_with("stats:p1:traces:"));
    assert_eq!(key, query.clone().cache_key());
  }

  #[test]
  fn cache_keys_distinguish_filters() {
    let start = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
    let base = StatsQuery {
      project_id: "p1".into(),
      source: StatsSource::Traces,
      filter: StatsFilter::default(),
      range: TimeRange {
        start,
        end: start + chrono::Duration::hours(1),
      },
      top_n: 5,
    };
    let with = |environment: Option<&str>, group: Option<&str>| StatsQuery {
      filter: StatsFilter {
        environment: environment.map(String::from),
        group: group.map(String::from),
      },
      ..base.clone()
    };

    let keys = [
      base.cache_key(),
      with(Some("*"), None).cache_key(),
      with(None, Some("*")).cache_key(),
      with(Some("a:b"), Some("c")).cache_key(),
      with(Some("a"), Some("b:c")).cache_key(),
      with(Some(""), None).cache_key(),
    ];
    let distinct: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(distinct.len(), keys.len());
  }

  #[test]
  fn request_wire_shape_is_camel_case() {
    let json = r#"{
      "eventId": "e1",
      "timestamp": "2025-01-15T10:30:00Z",
      "level": "error",
      "message": "boom",
      "exception": {"type": "TypeError", "value": "x is undefined",
        "stacktrace": [{"filename": "src/a.ts", "function": "f", "lineno": 3, "colno": 7}]},
      "contexts": {"user": {"id": 42}},
      "serverName": "web-1",
      "fingerprint": ["custom"]
    }"#;
    let raw: IngestRequest = serde_json::from_str(json).unwrap();
    assert_eq!(raw.event_id, "e1");
    assert_eq!(raw.server_name.as_deref(), Some("web-1"));
    let exc = raw.exception.unwrap();
    assert_eq!(exc.exception_type.as_deref(), Some("TypeError"));
    assert_eq!(exc.stacktrace[0].colno, Some(7));
    assert_eq!(raw.fingerprint, Some(vec!["custom".to_string()]));
  }

  #[test]
  fn response_omits_regression_flag() {
    let result = IngestResult {
      event_id: "e1".into(),
      issue_id: IssueId("i1".into()),
      is_new_issue: true,
      regressed: true,
      fingerprint_hash: "abc".into(),
      rate_limit: RateLimitDecision {
        allowed: true,
        remaining: 9,
        reset_in_secs: 30,
      },
    };
    let json = serde_json::to_value(IngestResponse::from(&result)).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"eventId": "e1", "issueId": "i1", "isNewIssue": true})
    );
  }
}
