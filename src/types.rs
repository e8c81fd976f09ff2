//! Core types for the coincidence engine (JSON contracts + internal models).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Convert fractional seconds to an exact nanosecond duration.
pub fn secs_to_duration(secs: f64) -> Duration {
  Duration::nanoseconds((secs * 1e9).round() as i64)
}

/// Convert a duration back to fractional seconds.
pub fn duration_to_secs(d: Duration) -> f64 {
  match d.num_nanoseconds() {
    Some(ns) => ns as f64 / 1e9,
    None => d.num_milliseconds() as f64 / 1e3,
  }
}

// ---------------------------------------------------------------------------
// Inbound types (JSON contract — what the caller sends)
// ---------------------------------------------------------------------------

/// One inbound event line. Unknown fields are silently ignored.
///
/// `timestamp` is the peak time; `start`/`duration` describe the event's
/// interval (both optional; a bare timestamp is a zero-length event). The
/// remaining numeric fields are opaque payload used only by matcher
/// predicates and combiners.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
  pub detector: String,
  pub timestamp: String,
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub start: Option<String>,
  #[serde(default)]
  pub duration: f64,
  #[serde(default)]
  pub central_freq: f64,
  #[serde(default)]
  pub bandwidth: f64,
  #[serde(default)]
  pub snr: f64,
  #[serde(default)]
  pub confidence: f64,
  #[serde(default)]
  pub amplitude: f64,
}

/// One-line run setup: detector sites, offset vectors, search tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSetup {
  pub detectors: Vec<InboundDetector>,
  pub offset_vectors: Vec<InboundOffsetVector>,
  #[serde(default)]
  pub window_secs: Option<f64>,
  #[serde(default)]
  pub min_instruments: Option<usize>,
  #[serde(default)]
  pub policy: Option<String>,
  /// Detector-id sets whose exact-combination groups are vetoed.
  #[serde(default)]
  pub forbidden_sets: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundDetector {
  pub id: String,
  /// Geocentric position in meters; omitted means co-located (zero delay).
  #[serde(default)]
  pub position: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundOffsetVector {
  pub id: String,
  /// Detector id -> time shift in seconds.
  pub shifts: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// Canonical internal event after normalization + validation.
///
/// Immutable once ingested; owned by its detector's timeline and referenced
/// by stable indices until emission, when members are copied out for the
/// sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
  /// Caller-supplied id, or `"{detector}:{n}"` assigned at ingestion.
  pub id: String,
  pub detector: String,
  pub peak: DateTime<Utc>,
  pub start: DateTime<Utc>,
  /// Interval length in seconds.
  pub duration: f64,
  pub central_freq: f64,
  pub bandwidth: f64,
  pub snr: f64,
  pub confidence: f64,
  pub amplitude: f64,
}

impl Event {
  /// End of the event's time interval.
  pub fn interval_end(&self) -> DateTime<Utc> {
    self.start + secs_to_duration(self.duration)
  }

  /// Largest distance between the peak and either interval edge.
  pub fn edge_skew(&self) -> Duration {
    let lead = self.peak - self.start;
    let tail = self.interval_end() - self.peak;
    lead.max(tail).max(Duration::zero())
  }
}

/// A named set of artificial time shifts, one per detector. Read-only after
/// graph construction.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetVector {
  pub id: String,
  pub shifts: HashMap<String, Duration>,
}

impl OffsetVector {
  /// Shift for a detector; zero when the vector does not name it.
  pub fn shift(&self, detector: &str) -> Duration {
    self.shifts.get(detector).copied().unwrap_or_else(Duration::zero)
  }

  /// The vector's detectors in the fixed (lexicographic) search ordering.
  pub fn detectors(&self) -> Vec<String> {
    let mut detectors: Vec<String> = self.shifts.keys().cloned().collect();
    detectors.sort();
    detectors
  }
}

/// One event's membership in a candidate group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMember {
  pub detector: String,
  pub event: Event,
}

/// A mutually coincident tuple of events (at most one per detector) under
/// one offset vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
  pub vector: OffsetVector,
  /// Detector-sorted; size >= the configured minimum at emission.
  pub members: Vec<GroupMember>,
}

impl CandidateGroup {
  pub fn instruments(&self) -> Vec<String> {
    self.members.iter().map(|m| m.detector.clone()).collect()
  }
}

// ---------------------------------------------------------------------------
// Output types (JSON contract — what we emit)
// ---------------------------------------------------------------------------

/// Which detector contributed which event to a record.
#[derive(Debug, Clone, Serialize)]
pub struct ContributionOutput {
  pub detector: String,
  pub event_id: String,
  pub timestamp: DateTime<Utc>,
}

/// Combiner-produced derived fields.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedFields {
  pub snr: f64,
  pub peak_time: DateTime<Utc>,
  pub duration: f64,
  pub central_freq: f64,
  pub bandwidth: f64,
  pub confidence: f64,
  pub amplitude: f64,
}

/// One output record per surviving group. Immutable; ownership passes to the
/// sink.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedRecord {
  pub record_id: String,
  pub vector_id: String,
  pub instruments: Vec<String>,
  pub contributions: Vec<ContributionOutput>,
  #[serde(flatten)]
  pub combined: Option<CombinedFields>,
}

/// Run counters reported at end-of-stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
  pub events: u64,
  pub groups: u64,
  pub vetoed: u64,
  pub records: u64,
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output for invalid input lines.
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

  fn t(secs: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + secs_to_duration(secs)
  }

  #[test]
  fn seconds_round_trip_exactly() {
    let d = secs_to_duration(0.125);
    assert_eq!(duration_to_secs(d), 0.125);
    assert_eq!(secs_to_duration(-1.5) + secs_to_duration(1.5), Duration::zero());
  }

  #[test]
  fn edge_skew_covers_both_edges() {
    let event = Event {
      id: String::new(),
      detector: "A".into(),
      peak: t(1.0),
      start: t(0.0),
      duration: 4.0,
      central_freq: 0.0,
      bandwidth: 0.0,
      snr: 0.0,
      confidence: 0.0,
      amplitude: 0.0,
    };
    // Peak sits 1 s after start, 3 s before the end; the tail dominates.
    assert_eq!(event.edge_skew(), secs_to_duration(3.0));
  }

  #[test]
  fn vector_shift_defaults_to_zero_for_unknown_detector() {
    let vector = OffsetVector {
      id: "slide-0".into(),
      shifts: HashMap::from([("A".into(), secs_to_duration(1.0))]),
    };
    assert_eq!(vector.shift("A"), secs_to_duration(1.0));
    assert_eq!(vector.shift("Z"), Duration::zero());
  }

  #[test]
  fn vector_detectors_are_sorted() {
    let vector = OffsetVector {
      id: "slide-0".into(),
      shifts: HashMap::from([
        ("C".into(), Duration::zero()),
        ("A".into(), Duration::zero()),
        ("B".into(), Duration::zero()),
      ]),
    };
    assert_eq!(vector.detectors(), vec!["A", "B", "C"]);
  }

  #[test]
  fn combined_record_serializes_flat_fields() {
    let record = CombinedRecord {
      record_id: "coinc-0011223344556677".into(),
      vector_id: "slide-0".into(),
      instruments: vec!["A".into(), "B".into()],
      contributions: vec![],
      combined: Some(CombinedFields {
        snr: 5.0,
        peak_time: t(0.0),
        duration: 0.1,
        central_freq: 120.0,
        bandwidth: 16.0,
        confidence: 2.0,
        amplitude: 1e-21,
      }),
    };
    let json = serde_json::to_value(&record).unwrap();
    // Combiner fields flatten into the record itself.
    assert_eq!(json["snr"], 5.0);
    assert_eq!(json["vector_id"], "slide-0");
  }
}
