//! Stable fingerprint computation for grouping events into issues.

use crate::types::{Event, Fingerprint, StackFrame};

/// Joins tokens before hashing; not expected inside any token.
const TOKEN_SEPARATOR: &[u8] = b"\x1f";

/// Compute a stable fingerprint from an event.
///
/// Token selection, first match wins:
/// 1. the caller-supplied override, verbatim;
/// 2. exception type followed by up to `max_frames` leading in-app frames as `file:function`;
/// 3. the raw message.
///
/// The culprit always comes from the first in-app frame so overridden events still
/// display where they were thrown. Uses blake3 over the separator-joined tokens; nothing
/// time- or id-dependent goes in.
pub fn compute(event: &Event, max_frames: usize, external_markers: &[String]) -> Fingerprint {
  let in_app: Vec<&StackFrame> = event
    .exception
    .as_ref()
    .map(|exc| {
      exc
        .frames
        .iter()
        .filter(|f| !is_external(f, external_markers))
        .collect()
    })
    .unwrap_or_default();

  let culprit = in_app
    .first()
    .map(|f| format!("{} ({})", f.function, f.filename));

  let tokens = match (&event.fingerprint_override, &event.exception) {
    (Some(tokens), _) => tokens.clone(),
    (None, Some(exc)) => {
      let mut tokens = Vec::with_capacity(1 + max_frames.min(in_app.len()));
      tokens.push(exc.exception_type.clone().unwrap_or_else(|| "Error".into()));
      tokens.extend(
        in_app
          .iter()
          .take(max_frames)
          .map(|f| format!("{}:{}", f.filename, f.function)),
      );
      tokens
    }
    (None, None) => vec![event.message.clone()],
  };

  let hash = hash_tokens(&tokens);
  Fingerprint {
    tokens,
    hash,
    culprit,
  }
}

/// Hex blake3 digest over the token sequence. Order- and case-sensitive.
pub fn hash_tokens(tokens: &[String]) -> String {
  let mut hasher = blake3::Hasher::new();
  for (i, token) in tokens.iter().enumerate() {
    if i > 0 {
      hasher.update(TOKEN_SEPARATOR);
    }
    hasher.update(token.as_bytes());
  }
  hasher.finalize().to_hex().to_string()
}

fn is_external(frame: &StackFrame, markers: &[String]) -> bool {
  markers.iter().any(|m| frame.filename.contains(m.as_str()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::types::{Event, Exception, Level, StackFrame};
  use chrono::{TimeZone, Utc};
  use std::collections::BTreeMap;

  fn frame(file: &str, func: &str) -> StackFrame {
    StackFrame {
      filename: file.into(),
      function: func.into(),
      line: Some(1),
      column: None,
      source_context: None,
    }
  }

  fn make_event(exc: Option<&str>, frames: Vec<(&str, &str)>) -> Event {
    Event {
      event_id: "evt".into(),
      project_id: "p1".into(),
      timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
      level: Level::Error,
      message: "test".into(),
      exception: Some(Exception {
        exception_type: exc.map(String::from),
        value: Some("boom".into()),
        frames: frames.into_iter().map(|(f, n)| frame(f, n)).collect(),
      }),
      breadcrumbs: Vec::new(),
      contexts: BTreeMap::new(),
      tags: BTreeMap::new(),
      environment: None,
      release: None,
      server_name: None,
      request_id: None,
      transaction_id: None,
      fingerprint_override: None,
    }
  }

  fn fp(event: &Event) -> Fingerprint {
    let config = Config::default();
    compute(event, config.fingerprint_max_frames, &config.external_frame_markers)
  }

  #[test]
  fn same_input_same_fingerprint() {
    let e1 = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    let e2 = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    assert_eq!(fp(&e1), fp(&e2));
  }

  #[test]
  fn ignores_timestamp_and_event_id() {
    let e1 = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    let mut e2 = e1.clone();
    e2.event_id = "other".into();
    e2.timestamp = Utc.with_ymd_and_hms(2031, 6, 1, 0, 0, 0).unwrap();
    e2.tags.insert("k".into(), "v".into());
    assert_eq!(fp(&e1).hash, fp(&e2).hash);
  }

  #[test]
  fn hash_frames_tokens_with_unit_separator() {
    // Changing the framing silently splits every existing issue.
    let tokens = vec!["TypeError".to_string(), "src/a.ts:foo".to_string()];
    let expected = {
      let mut h = blake3::Hasher::new();
      h.update(b"TypeError\x1fsrc/a.ts:foo");
      h.finalize().to_hex().to_string()
    };
    assert_eq!(hash_tokens(&tokens), expected);
    assert_eq!(expected.len(), 64);
  }

  #[test]
  fn different_exception_different_fingerprint() {
    let e1 = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    let e2 = make_event(Some("ValueError"), vec![("src/a.ts", "foo")]);
    assert_ne!(fp(&e1).hash, fp(&e2).hash);
  }

  #[test]
  fn tokens_are_case_and_order_sensitive() {
    let e1 = make_event(Some("TypeError"), vec![("src/a.ts", "foo"), ("src/b.ts", "bar")]);
    let e2 = make_event(Some("TypeError"), vec![("src/b.ts", "bar"), ("src/a.ts", "foo")]);
    let e3 = make_event(Some("typeerror"), vec![("src/a.ts", "foo"), ("src/b.ts", "bar")]);
    assert_ne!(fp(&e1).hash, fp(&e2).hash);
    assert_ne!(fp(&e1).hash, fp(&e3).hash);
  }

  #[test]
  fn missing_type_defaults_to_error() {
    let e = make_event(None, vec![]);
    assert_eq!(fp(&e).tokens, vec!["Error"]);
  }

  #[test]
  fn external_frames_are_skipped() {
    let e = make_event(
      Some("TypeError"),
      vec![
        ("node_modules/react/index.js", "render"),
        ("src/app.ts", "main"),
        ("vendor/lib.php", "call"),
      ],
    );
    let f = fp(&e);
    assert_eq!(f.tokens, vec!["TypeError", "src/app.ts:main"]);
    assert_eq!(f.culprit.as_deref(), Some("main (src/app.ts)"));
  }

  #[test]
  fn only_external_frames_leaves_no_culprit() {
    let e = make_event(Some("TypeError"), vec![("node_modules/x.js", "f")]);
    let f = fp(&e);
    assert_eq!(f.tokens, vec!["TypeError"]);
    assert!(f.culprit.is_none());
  }

  #[test]
  fn extra_frames_beyond_max_ignored() {
    let e1 = make_event(
      Some("TypeError"),
      vec![("src/a.ts", "foo"), ("src/b.ts", "bar"), ("src/c.ts", "baz")],
    );
    let e2 = make_event(Some("TypeError"), vec![("src/a.ts", "foo"), ("src/b.ts", "bar")]);
    let markers = Config::default().external_frame_markers;
    assert_eq!(compute(&e1, 2, &markers).hash, compute(&e2, 2, &markers).hash);
  }

  #[test]
  fn message_only_groups_by_message() {
    let mut e = make_event(None, vec![]);
    e.exception = None;
    e.message = "disk almost full".into();
    let f = fp(&e);
    assert_eq!(f.tokens, vec!["disk almost full"]);
    assert!(f.culprit.is_none());
  }

  #[test]
  fn override_is_used_verbatim() {
    let mut e = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    e.fingerprint_override = Some(vec!["payments".into(), "timeout".into()]);
    let f = fp(&e);
    assert_eq!(f.tokens, vec!["payments", "timeout"]);
    assert_eq!(f.culprit.as_deref(), Some("foo (src/a.ts)"));

    let mut other = make_event(Some("ValueError"), vec![("src/z.ts", "zzz")]);
    other.fingerprint_override = Some(vec!["payments".into(), "timeout".into()]);
    assert_eq!(f.hash, fp(&other).hash);
  }

  #[test]
  fn fingerprint_is_64_hex_chars() {
    let e = make_event(Some("TypeError"), vec![("src/a.ts", "foo")]);
    let f = fp(&e);
    assert_eq!(f.hash.len(), 64);
    assert!(f.hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
