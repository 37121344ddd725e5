//! Normalize inbound payloads into canonical internal models.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::types::*;

/// Parse and validate an IngestRequest into a canonical Event.
pub fn normalize(
  project_id: &str,
  raw: &IngestRequest,
  max_breadcrumbs: usize,
) -> Result<Event, EngineError> {
  if project_id.is_empty() {
    return Err(EngineError::validation("projectId", "must not be empty"));
  }
  if raw.event_id.trim().is_empty() {
    return Err(EngineError::validation("eventId", "must not be empty"));
  }

  let timestamp = parse_timestamp("timestamp", &raw.timestamp)?;

  let level = Level::from_str_loose(&raw.level)
    .ok_or_else(|| EngineError::validation("level", "expected debug|info|warning|error|fatal"))?;

  let exception = raw.exception.as_ref().map(|exc| Exception {
    exception_type: non_empty(&exc.exception_type),
    value: non_empty(&exc.value),
    frames: exc
      .stacktrace
      .iter()
      .map(|f| StackFrame {
        filename: f.filename.as_deref().map(normalize_path).unwrap_or_default(),
        function: f
          .function
          .as_deref()
          .filter(|s| !s.is_empty())
          .unwrap_or("<anonymous>")
          .to_string(),
        line: f.lineno,
        column: f.colno,
        source_context: f.context_line.clone(),
      })
      .collect(),
  });

  // Message-only events group by message, so it has to carry something.
  if exception.is_none() && raw.message.trim().is_empty() {
    return Err(EngineError::validation(
      "message",
      "must not be empty when no exception is present",
    ));
  }

  let fingerprint_override = raw
    .fingerprint
    .as_ref()
    .filter(|tokens| !tokens.is_empty())
    .cloned();

  // Keep the most recent breadcrumbs.
  let skip = raw.breadcrumbs.len().saturating_sub(max_breadcrumbs);
  let breadcrumbs = raw.breadcrumbs[skip..].to_vec();

  Ok(Event {
    event_id: raw.event_id.clone(),
    project_id: project_id.to_string(),
    timestamp,
    level,
    message: raw.message.clone(),
    exception,
    breadcrumbs,
    contexts: raw.contexts.clone(),
    tags: raw.tags.clone(),
    environment: non_empty(&raw.environment),
    release: non_empty(&raw.release),
    server_name: non_empty(&raw.server_name),
    request_id: non_empty(&raw.request_id),
    transaction_id: non_empty(&raw.transaction_id),
    fingerprint_override,
  })
}

/// Parse and validate a TraceRequest into a TraceRecord.
pub fn normalize_trace(project_id: &str, raw: &TraceRequest) -> Result<TraceRecord, EngineError> {
  if project_id.is_empty() {
    return Err(EngineError::validation("projectId", "must not be empty"));
  }
  if raw.trace_id.is_empty() {
    return Err(EngineError::validation("traceId", "must not be empty"));
  }
  if raw.name.is_empty() {
    return Err(EngineError::validation("name", "must not be empty"));
  }
  if !raw.duration_ms.is_finite() || raw.duration_ms < 0.0 {
    return Err(EngineError::validation(
      "durationMs",
      "must be a non-negative number",
    ));
  }

  Ok(TraceRecord {
    trace_id: raw.trace_id.clone(),
    project_id: project_id.to_string(),
    name: raw.name.clone(),
    timestamp: parse_timestamp("timestamp", &raw.timestamp)?,
    duration_ms: raw.duration_ms,
    status_code: raw.status_code,
    environment: non_empty(&raw.environment),
  })
}

fn parse_timestamp(field: &str, s: &str) -> Result<DateTime<Utc>, EngineError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::validation(field, &format!("invalid RFC3339: {}", e)))
}

fn non_empty(s: &Option<String>) -> Option<String> {
  s.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Normalize a file path for stable comparison:
/// - backslash -> forward slash
/// - collapse repeated slashes
/// - strip leading ./
///
/// Case is preserved; grouping tokens are case-sensitive.
fn normalize_path(p: &str) -> String {
  let s = p.replace('\\', "/");
  let mut out = String::with_capacity(s.len());
  let mut prev_slash = false;
  for ch in s.chars() {
    if ch == '/' {
      if !prev_slash {
        out.push('/');
      }
      prev_slash = true;
    } else {
      prev_slash = false;
      out.push(ch);
    }
  }
  match out.strip_prefix("./") {
    Some(rest) => rest.to_string(),
    None => out,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn raw_event() -> IngestRequest {
    serde_json::from_value(serde_json::json!({
      "eventId": "evt-1",
      "timestamp": "2025-01-15T10:30:00Z",
      "level": "error",
      "message": "cannot read property x",
      "exception": {
        "type": "TypeError",
        "value": "x is undefined",
        "stacktrace": [
          {"filename": ".\\src\\handler.ts", "function": "handle", "lineno": 42},
          {"filename": "src/App.tsx"}
        ]
      },
      "environment": "prod",
      "release": ""
    }))
    .unwrap()
  }

  #[test]
  fn normalize_path_basics() {
    assert_eq!(normalize_path("src\\auth\\jwt.go"), "src/auth/jwt.go");
    assert_eq!(normalize_path("./src//utils/index.ts"), "src/utils/index.ts");
    assert_eq!(normalize_path("SRC/App.tsx"), "SRC/App.tsx");
  }

  #[test]
  fn normalize_valid_event() {
    let event = normalize("p1", &raw_event(), 100).unwrap();
    assert_eq!(event.project_id, "p1");
    assert_eq!(event.level, Level::Error);
    assert_eq!(event.environment.as_deref(), Some("prod"));
    assert_eq!(event.release, None);
    let exc = event.exception.unwrap();
    assert_eq!(exc.frames[0].filename, "src/handler.ts");
    assert_eq!(exc.frames[0].line, Some(42));
    assert_eq!(exc.frames[1].function, "<anonymous>");
  }

  #[test]
  fn normalize_rejects_bad_timestamp() {
    let mut raw = raw_event();
    raw.timestamp = "yesterday".into();
    let err = normalize("p1", &raw, 100).unwrap_err();
    assert!(err.to_string().contains("timestamp"));
  }

  #[test]
  fn normalize_rejects_unknown_level() {
    let mut raw = raw_event();
    raw.level = "loud".into();
    let err = normalize("p1", &raw, 100).unwrap_err();
    assert!(err.to_string().contains("level"));
  }

  #[test]
  fn message_only_event_needs_message() {
    let mut raw = raw_event();
    raw.exception = None;
    raw.message = "  ".into();
    let err = normalize("p1", &raw, 100).unwrap_err();
    assert!(err.to_string().contains("message"));
  }

  #[test]
  fn breadcrumbs_keep_most_recent() {
    let mut raw = raw_event();
    raw.breadcrumbs = (0..5)
      .map(|i| Breadcrumb {
        message: Some(format!("crumb {}", i)),
        ..Breadcrumb::default()
      })
      .collect();
    let event = normalize("p1", &raw, 2).unwrap();
    let messages: Vec<_> = event
      .breadcrumbs
      .iter()
      .filter_map(|b| b.message.as_deref())
      .collect();
    assert_eq!(messages, vec!["crumb 3", "crumb 4"]);
  }

  #[test]
  fn empty_override_is_ignored() {
    let mut raw = raw_event();
    raw.fingerprint = Some(vec![]);
    let event = normalize("p1", &raw, 100).unwrap();
    assert!(event.fingerprint_override.is_none());
  }

  #[test]
  fn user_id_from_contexts() {
    let mut raw = raw_event();
    raw.contexts.insert("user".into(), serde_json::json!({"id": 7}));
    let event = normalize("p1", &raw, 100).unwrap();
    assert_eq!(event.user_id().as_deref(), Some("7"));
  }

  #[test]
  fn trace_rejects_negative_duration() {
    let raw: TraceRequest = serde_json::from_value(serde_json::json!({
      "traceId": "t1",
      "name": "GET /users",
      "timestamp": "2025-01-15T10:30:00Z",
      "durationMs": -1.0
    }))
    .unwrap();
    let err = normalize_trace("p1", &raw).unwrap_err();
    assert!(err.to_string().contains("durationMs"));
  }
}
