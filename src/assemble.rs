//! Record assembly: final whole-group veto, optional combiner, and
//! combined-record synthesis.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::EngineError;
use crate::types::{
  duration_to_secs, secs_to_duration, CandidateGroup, CombinedFields, CombinedRecord,
  ContributionOutput, GroupMember, OffsetVector,
};

/// Whole-group veto: `true` discards the group.
pub type VetoFn = dyn Fn(&[GroupMember], &OffsetVector) -> Result<bool, EngineError>;

/// Derives combined output fields from a surviving group.
pub type CombinerFn = dyn Fn(&[GroupMember], &OffsetVector) -> Result<CombinedFields, EngineError>;

/// Convert one surviving group into at most one combined record.
///
/// The veto runs first; the combiner (when supplied) second. Caller-supplied
/// failures propagate unmodified and nothing is recorded for the group. The
/// record always carries which detector contributed which event.
pub fn assemble(
  group: &CandidateGroup,
  veto: Option<&VetoFn>,
  combiner: Option<&CombinerFn>,
) -> Result<Option<CombinedRecord>, EngineError> {
  if let Some(veto) = veto {
    if veto(&group.members, &group.vector)? {
      return Ok(None);
    }
  }

  let combined = match combiner {
    Some(combiner) => Some(combiner(&group.members, &group.vector)?),
    None => None,
  };

  let contributions = group
    .members
    .iter()
    .map(|m| ContributionOutput {
      detector: m.detector.clone(),
      event_id: m.event.id.clone(),
      timestamp: m.event.peak,
    })
    .collect();

  Ok(Some(CombinedRecord {
    record_id: record_id(group),
    vector_id: group.vector.id.clone(),
    instruments: group.instruments(),
    contributions,
    combined,
  }))
}

/// Stable record id: hash of the vector id and every member's identity.
fn record_id(group: &CandidateGroup) -> String {
  let mut hasher = blake3::Hasher::new();
  hasher.update(group.vector.id.as_bytes());
  for member in &group.members {
    hasher.update(b"|");
    hasher.update(member.detector.as_bytes());
    hasher.update(b":");
    hasher.update(member.event.id.as_bytes());
  }
  let hex = hasher.finalize().to_hex();
  format!("coinc-{}", &hex[..16])
}

/// Example combiner: snr-weighted multi-detector averages.
///
/// Combined snr is the root sum of member snr squares. Peak time, duration,
/// central frequency and bandwidth are snr^2-weighted averages; the first
/// member's shifted peak anchors the epoch so timestamps never round-trip
/// through absolute floats. Confidence is the member minimum; amplitude is
/// taken from the highest-confidence member. A group with zero total snr
/// falls back to equal weights.
pub fn snr_weighted(
  members: &[GroupMember],
  vector: &OffsetVector,
) -> Result<CombinedFields, EngineError> {
  let Some(first) = members.first() else {
    return Err(EngineError::external("combiner: empty group"));
  };

  let total: f64 = members.iter().map(|m| m.event.snr * m.event.snr).sum();
  let weights: Vec<f64> = if total > 0.0 {
    members.iter().map(|m| m.event.snr * m.event.snr / total).collect()
  } else {
    vec![1.0 / members.len() as f64; members.len()]
  };

  let epoch = first.event.peak + vector.shift(&first.detector);
  let mut peak_offset = 0.0;
  let mut duration = 0.0;
  let mut central_freq = 0.0;
  let mut bandwidth = 0.0;
  let mut confidence = f64::INFINITY;
  for (member, weight) in members.iter().zip(&weights) {
    let shifted = member.event.peak + vector.shift(&member.detector);
    peak_offset += weight * duration_to_secs(shifted - epoch);
    duration += weight * member.event.duration;
    central_freq += weight * member.event.central_freq;
    bandwidth += weight * member.event.bandwidth;
    confidence = confidence.min(member.event.confidence);
  }

  let amplitude = members
    .iter()
    .max_by(|a, b| {
      a.event
        .confidence
        .partial_cmp(&b.event.confidence)
        .unwrap_or(Ordering::Equal)
    })
    .map(|m| m.event.amplitude)
    .unwrap_or(0.0);

  Ok(CombinedFields {
    snr: total.sqrt(),
    peak_time: epoch + secs_to_duration(peak_offset),
    duration,
    central_freq,
    bandwidth,
    confidence,
    amplitude,
  })
}

/// Veto constructor: discard any group whose detector set equals
/// `disallowed` exactly. A superset group with the same events survives.
pub fn forbid_detector_set(disallowed: BTreeSet<String>) -> Box<VetoFn> {
  Box::new(move |members, _vector| {
    let set: BTreeSet<String> = members.iter().map(|m| m.detector.clone()).collect();
    Ok(set == disallowed)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{secs_to_duration, Event};
  use chrono::{DateTime, TimeZone, Utc};
  use std::collections::HashMap;

  fn t(secs: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + secs_to_duration(secs)
  }

  fn member(detector: &str, secs: f64, snr: f64, confidence: f64, amplitude: f64) -> GroupMember {
    GroupMember {
      detector: detector.into(),
      event: Event {
        id: format!("{}:{}", detector, 0),
        detector: detector.into(),
        peak: t(secs),
        start: t(secs),
        duration: 1.0,
        central_freq: 100.0,
        bandwidth: 20.0,
        snr,
        confidence,
        amplitude,
      },
    }
  }

  fn zero_vector(detectors: &[&str]) -> OffsetVector {
    OffsetVector {
      id: "slide-0".into(),
      shifts: detectors
        .iter()
        .map(|&d| (d.to_string(), chrono::Duration::zero()))
        .collect(),
    }
  }

  fn pair_group() -> CandidateGroup {
    CandidateGroup {
      vector: zero_vector(&["A", "B"]),
      members: vec![
        member("A", 0.0, 3.0, 2.0, 1.0),
        member("B", 1.0, 4.0, 5.0, 7.0),
      ],
    }
  }

  #[test]
  fn combiner_math_matches_the_weighted_forms() {
    let group = pair_group();
    let fields = snr_weighted(&group.members, &group.vector).unwrap();
    // Root sum of squares: sqrt(9 + 16) = 5.
    assert!((fields.snr - 5.0).abs() < 1e-12);
    // Weighted peak: (9 * 0.0 + 16 * 1.0) / 25 = 0.64 s after the epoch.
    assert_eq!(fields.peak_time, t(0.64));
    // Confidence is the minimum; amplitude follows the max-confidence member.
    assert_eq!(fields.confidence, 2.0);
    assert_eq!(fields.amplitude, 7.0);
  }

  #[test]
  fn combiner_applies_vector_shifts_to_peaks() {
    let mut group = pair_group();
    group.vector.shifts =
      HashMap::from([("A".into(), chrono::Duration::zero()), ("B".into(), secs_to_duration(-1.0))]);
    let fields = snr_weighted(&group.members, &group.vector).unwrap();
    // B's shifted peak lands on the epoch, so the average stays there.
    assert_eq!(fields.peak_time, t(0.0));
  }

  #[test]
  fn zero_snr_group_falls_back_to_equal_weights() {
    let group = CandidateGroup {
      vector: zero_vector(&["A", "B"]),
      members: vec![
        member("A", 0.0, 0.0, 1.0, 1.0),
        member("B", 1.0, 0.0, 1.0, 1.0),
      ],
    };
    let fields = snr_weighted(&group.members, &group.vector).unwrap();
    assert_eq!(fields.snr, 0.0);
    assert_eq!(fields.peak_time, t(0.5));
  }

  #[test]
  fn assemble_records_contributions_and_stable_id() {
    let group = pair_group();
    let record = assemble(&group, None, None).unwrap().unwrap();
    assert!(record.record_id.starts_with("coinc-"));
    assert_eq!(record.instruments, vec!["A", "B"]);
    assert_eq!(record.contributions.len(), 2);
    assert_eq!(record.contributions[0].event_id, "A:0");
    assert!(record.combined.is_none());

    let again = assemble(&group, None, None).unwrap().unwrap();
    assert_eq!(record.record_id, again.record_id);
  }

  #[test]
  fn veto_discards_the_group() {
    let group = pair_group();
    let veto = forbid_detector_set(BTreeSet::from(["A".to_string(), "B".to_string()]));
    let result = assemble(&group, Some(veto.as_ref()), None).unwrap();
    assert!(result.is_none());
  }

  #[test]
  fn forbidden_set_must_match_exactly() {
    let veto = forbid_detector_set(BTreeSet::from(["A".to_string(), "B".to_string()]));
    let triple = CandidateGroup {
      vector: zero_vector(&["A", "B", "C"]),
      members: vec![
        member("A", 0.0, 1.0, 1.0, 1.0),
        member("B", 0.1, 1.0, 1.0, 1.0),
        member("C", 0.2, 1.0, 1.0, 1.0),
      ],
    };
    let result = assemble(&triple, Some(veto.as_ref()), None).unwrap();
    assert!(result.is_some(), "superset of the forbidden set must survive");
  }

  #[test]
  fn combiner_failure_propagates_unmodified() {
    let group = pair_group();
    let combiner: Box<CombinerFn> =
      Box::new(|_, _| Err(EngineError::external("combiner: bad payload")));
    let err = assemble(&group, None, Some(combiner.as_ref())).unwrap_err();
    assert_eq!(err.to_string(), "combiner: bad payload");
  }
}
