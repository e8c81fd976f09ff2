//! Pairwise coincidence policies: fixed-window and interval-overlap.

use chrono::Duration;
use std::collections::HashMap;

use crate::config::{Config, PolicyKind};
use crate::timeline::Timeline;
use crate::types::{secs_to_duration, Event};

/// A pairwise coincidence test between a shifted reference event and one
/// unshifted timeline.
///
/// `search_padding` bounds the peak-time window that can contain matches,
/// so a pair of bisections narrows the candidate set before `coincident`,
/// the exact predicate, is applied. The reference event is always the
/// shifted side; the timeline side is never shifted.
pub trait MatchPolicy {
  fn name(&self) -> &'static str;

  /// Hook run after new events land on a detector's timeline.
  fn reindex(&mut self, _detector: &str, _timeline: &Timeline) {}

  /// Half-width of the peak-time window around the shifted reference peak
  /// that can possibly contain coincident events of `b_detector`.
  fn search_padding(&self, a: &Event, delay: Duration, b_detector: &str) -> Duration;

  /// Exact test: is `b` coincident with `a` once `a` is shifted by
  /// `rel_offset`? Pure.
  fn coincident(&self, a: &Event, rel_offset: Duration, b: &Event, delay: Duration) -> bool;

  /// Upper bound on any `search_padding` this policy can currently return,
  /// excluding the propagation delay.
  fn horizon(&self) -> Duration;
}

/// Events of `timeline` coincident with `a` shifted by `rel_offset`.
///
/// Bisection pre-filter first, exact predicate second. An empty timeline
/// yields an empty match set.
pub fn matches<'a>(
  policy: &dyn MatchPolicy,
  a: &Event,
  rel_offset: Duration,
  timeline: &'a Timeline,
  delay: Duration,
) -> Vec<(u64, &'a Event)> {
  let center = a.peak + rel_offset;
  let padding = policy.search_padding(a, delay, timeline.detector());
  timeline
    .range_query(center - padding, center + padding)
    .filter(|(_, b)| policy.coincident(a, rel_offset, b, delay))
    .collect()
}

/// Build the configured policy.
pub fn build_policy(config: &Config) -> Box<dyn MatchPolicy> {
  match config.policy {
    PolicyKind::FixedWindow => Box::new(FixedWindowPolicy::new(config.window_secs)),
    PolicyKind::IntervalOverlap => Box::new(IntervalOverlapPolicy::new()),
  }
}

// ---------------------------------------------------------------------------
// Fixed-window policy
// ---------------------------------------------------------------------------

/// Coincident iff the shifted peak times differ by no more than
/// `window + delay`. The bisection window is exact for this policy.
#[derive(Debug, Clone)]
pub struct FixedWindowPolicy {
  window: Duration,
}

impl FixedWindowPolicy {
  pub fn new(window_secs: f64) -> Self {
    Self { window: secs_to_duration(window_secs) }
  }
}

impl MatchPolicy for FixedWindowPolicy {
  fn name(&self) -> &'static str {
    "fixed_window"
  }

  fn search_padding(&self, _a: &Event, delay: Duration, _b_detector: &str) -> Duration {
    self.window + delay
  }

  fn coincident(&self, a: &Event, rel_offset: Duration, b: &Event, delay: Duration) -> bool {
    let difference = (a.peak + rel_offset) - b.peak;
    difference.abs() <= self.window + delay
  }

  fn horizon(&self) -> Duration {
    self.window
  }
}

// ---------------------------------------------------------------------------
// Interval-overlap policy
// ---------------------------------------------------------------------------

/// Coincident iff the central frequencies are compatible and the two event
/// intervals, extended by the propagation delay, overlap.
///
/// Per detector, the maximum skew between any event's peak and its interval
/// edges is precomputed on reindex, so a single peak-time window safely
/// bounds the search before the exact interval test runs on the narrowed
/// candidates.
#[derive(Debug, Clone)]
pub struct IntervalOverlapPolicy {
  edge_skew: HashMap<String, Duration>,
  /// Largest skew ever observed; keeps the horizon from shrinking when
  /// timelines are trimmed.
  max_skew: Duration,
}

impl IntervalOverlapPolicy {
  pub fn new() -> Self {
    Self {
      edge_skew: HashMap::new(),
      max_skew: Duration::zero(),
    }
  }
}

impl Default for IntervalOverlapPolicy {
  fn default() -> Self {
    Self::new()
  }
}

impl MatchPolicy for IntervalOverlapPolicy {
  fn name(&self) -> &'static str {
    "interval_overlap"
  }

  fn reindex(&mut self, detector: &str, timeline: &Timeline) {
    let skew = timeline
      .iter()
      .map(|(_, e)| e.edge_skew())
      .max()
      .unwrap_or_else(Duration::zero);
    if skew > self.max_skew {
      self.max_skew = skew;
    }
    self.edge_skew.insert(detector.to_string(), skew);
  }

  fn search_padding(&self, a: &Event, delay: Duration, b_detector: &str) -> Duration {
    let skew_b = self
      .edge_skew
      .get(b_detector)
      .copied()
      .unwrap_or_else(Duration::zero);
    // If the peaks differ by more than both events' edge skews plus the
    // delay, the intervals cannot intersect.
    a.edge_skew() + skew_b + delay
  }

  fn coincident(&self, a: &Event, rel_offset: Duration, b: &Event, delay: Duration) -> bool {
    if (a.central_freq - b.central_freq).abs() > (a.bandwidth + b.bandwidth) / 2.0 {
      return false;
    }
    let a_start = a.start + rel_offset;
    let a_end = a.interval_end() + rel_offset;
    a_start <= b.interval_end() + delay && b.start <= a_end + delay
  }

  fn horizon(&self) -> Duration {
    self.max_skew * 2
  }
}
