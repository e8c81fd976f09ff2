//! Engine configuration with sane defaults.

use serde::{Deserialize, Serialize};

/// Which pairwise coincidence test the graph runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
  FixedWindow,
  IntervalOverlap,
}

impl PolicyKind {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "fixed_window" | "fixed" | "window" => Some(Self::FixedWindow),
      "interval_overlap" | "interval" | "overlap" => Some(Self::IntervalOverlap),
      _ => None,
    }
  }
}

/// Tunable thresholds for the coincidence search.
#[derive(Debug, Clone)]
pub struct Config {
  /// Pairwise matching policy.
  pub policy: PolicyKind,
  /// Coincidence half-window in seconds (fixed-window policy only; the
  /// interval-overlap policy derives its window from the event intervals).
  pub window_secs: f64,
  /// Smallest group size that may be emitted.
  pub min_instruments: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      policy: PolicyKind::FixedWindow,
      window_secs: 0.5,
      min_instruments: 2,
    }
  }
}
