//! Binary entrypoint: read JSON lines from stdin, write JSON lines to stdout.
//!
//! Each input line is an IngestEnvelope (`{"projectId": ..., "event": {...}}`). Output lines
//! are either:
//! - An IngestResponse (event grouped and stored)
//! - An ErrorOutput (input rejected or store failure)
//!
//! Logs go to stderr; filter with RUST_LOG.

use std::io::Write;

use ingest_engine::types::{ErrorOutput, IngestEnvelope};
use ingest_engine::{Config, Engine, EngineError, IngestResponse};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let config = match Config::from_env() {
    Ok(c) => c,
    Err(e) => {
      tracing::error!(error = %e, "invalid configuration");
      std::process::exit(2);
    }
  };

  let engine = Engine::in_memory(config);
  let mut lines = BufReader::new(io::stdin()).lines();
  let stdout = std::io::stdout();
  let mut out = std::io::BufWriter::new(stdout.lock());

  loop {
    let line = match lines.next_line().await {
      Ok(Some(l)) => l,
      Ok(None) => break,
      Err(e) => {
        tracing::error!(error = %e, "stdin read error");
        std::process::exit(1);
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let envelope: IngestEnvelope = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        emit(&mut out, &ErrorOutput::new(format!("json parse: {}", e)));
        continue;
      }
    };

    match engine.ingest(&envelope.project_id, &envelope.event).await {
      Ok(result) => {
        if result.regressed {
          tracing::info!(issue_id = %result.issue_id, "regression detected");
        }
        emit(&mut out, &IngestResponse::from(&result));
      }
      Err(EngineError::Validation { field, reason }) => {
        emit(&mut out, &ErrorOutput::new(reason).with_field(field));
      }
      Err(e) => emit(&mut out, &ErrorOutput::new(e.to_string())),
    }
  }

  engine.flush_background().await;
  let _ = out.flush();
}

fn emit<T: serde::Serialize>(out: &mut impl Write, value: &T) {
  let _ = serde_json::to_writer(&mut *out, value);
  let _ = writeln!(out);
}
