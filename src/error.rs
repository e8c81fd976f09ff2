//! Structured error types for the coincidence engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  /// An event or bound arrived behind a detector's already-advanced bound.
  /// This is a caller contract violation, not a recoverable state: accepting
  /// the event would silently produce an incomplete match set.
  #[error("out of order: {detector}: {timestamp} precedes advanced bound {bound}")]
  OutOfOrder {
    detector: String,
    timestamp: DateTime<Utc>,
    bound: DateTime<Utc>,
  },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  /// Failure raised by a caller-supplied combiner or veto; passes through
  /// the engine unmodified.
  #[error("{0}")]
  External(String),

  #[error("sink: {0}")]
  Sink(String),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn external(msg: impl Into<String>) -> Self {
    Self::External(msg.into())
  }

  pub fn sink(msg: impl Into<String>) -> Self {
    Self::Sink(msg.into())
  }
}
