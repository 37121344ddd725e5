//! Structured error types for the ingestion engine and its collaborators.

use thiserror::Error;

/// Failure reported by an event store, counter store or cache.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store unavailable: {0}")]
  Unavailable(String),

  #[error("operation timed out")]
  Timeout,

  #[error("serialisation error: {0}")]
  Serialisation(String),

  #[error("backend error: {0}")]
  Backend(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("store: {0}")]
  StoreUnavailable(#[from] StoreError),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("invalid transition: cannot {action} an issue that is {from}")]
  InvalidTransition { from: String, action: String },

  #[error("config: {key}: {reason}")]
  Config { key: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn not_found(what: impl Into<String>) -> Self {
    Self::NotFound(what.into())
  }

  pub fn config(key: &str, reason: &str) -> Self {
    Self::Config {
      key: key.to_string(),
      reason: reason.to_string(),
    }
  }
}
