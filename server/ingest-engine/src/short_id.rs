//! Per-project issue numbering and its display code.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::store::{with_timeout, CounterStore};

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub struct ShortIdSequencer {
  counters: Arc<dyn CounterStore>,
  timeout: Duration,
}

impl ShortIdSequencer {
  pub fn new(counters: Arc<dyn CounterStore>, timeout: Duration) -> Self {
    Self { counters, timeout }
  }

  /// Next number for the project, starting at 1. Gaps are possible, repeats are not.
  pub async fn next(&self, project_id: &str) -> Result<u64, EngineError> {
    let key = format!("shortid:{}", project_id);
    Ok(with_timeout(self.timeout, self.counters.increment(&key, None)).await?)
  }
}

/// Uppercase base-36 encoding of `n`.
pub fn format(n: u64) -> String {
  if n == 0 {
    return "0".into();
  }
  let mut digits = Vec::new();
  let mut rest = n;
  while rest > 0 {
    digits.push(ALPHABET[(rest % 36) as usize]);
    rest /= 36;
  }
  digits.reverse();
  String::from_utf8_lossy(&digits).into_owned()
}
