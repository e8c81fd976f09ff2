//! Normalize inbound JSON contracts into canonical internal models.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::config::{Config, PolicyKind};
use crate::error::EngineError;
use crate::geometry::DetectorSite;
use crate::types::{secs_to_duration, Event, InboundEvent, InboundSetup, OffsetVector};

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, EngineError> {
  DateTime::parse_from_rfc3339(value)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|e| EngineError::validation(field, &format!("invalid RFC3339: {}", e)))
}

fn require_finite(field: &str, value: f64) -> Result<(), EngineError> {
  if value.is_finite() {
    Ok(())
  } else {
    Err(EngineError::validation(field, "must be finite"))
  }
}

fn require_non_negative(field: &str, value: f64) -> Result<(), EngineError> {
  require_finite(field, value)?;
  if value < 0.0 {
    Err(EngineError::validation(field, "must not be negative"))
  } else {
    Ok(())
  }
}

/// Parse and normalize an InboundEvent into a canonical Event.
pub fn normalize_event(raw: &InboundEvent) -> Result<Event, EngineError> {
  if raw.detector.is_empty() {
    return Err(EngineError::validation("detector", "must not be empty"));
  }

  let peak = parse_time("timestamp", &raw.timestamp)?;
  let start = match &raw.start {
    Some(s) => parse_time("start", s)?,
    None => peak,
  };

  require_non_negative("duration", raw.duration)?;
  require_finite("central_freq", raw.central_freq)?;
  require_non_negative("bandwidth", raw.bandwidth)?;
  require_non_negative("snr", raw.snr)?;
  require_finite("confidence", raw.confidence)?;
  require_finite("amplitude", raw.amplitude)?;

  Ok(Event {
    id: raw.id.clone().unwrap_or_default(),
    detector: raw.detector.clone(),
    peak,
    start,
    duration: raw.duration,
    central_freq: raw.central_freq,
    bandwidth: raw.bandwidth,
    snr: raw.snr,
    confidence: raw.confidence,
    amplitude: raw.amplitude,
  })
}

/// Parse and validate the run setup: site table, offset vectors, config.
pub fn normalize_setup(
  raw: &InboundSetup,
) -> Result<(Vec<DetectorSite>, Vec<OffsetVector>, Config), EngineError> {
  if raw.detectors.is_empty() {
    return Err(EngineError::validation("detectors", "must not be empty"));
  }
  let mut seen_detectors = BTreeSet::new();
  let mut sites = Vec::with_capacity(raw.detectors.len());
  for detector in &raw.detectors {
    if detector.id.is_empty() {
      return Err(EngineError::validation("detectors[].id", "must not be empty"));
    }
    if !seen_detectors.insert(detector.id.clone()) {
      return Err(EngineError::validation("detectors[].id", "duplicate detector id"));
    }
    let position = detector.position.unwrap_or([0.0, 0.0, 0.0]);
    for coordinate in position {
      require_finite("detectors[].position", coordinate)?;
    }
    sites.push(DetectorSite {
      id: detector.id.clone(),
      position,
    });
  }

  if raw.offset_vectors.is_empty() {
    return Err(EngineError::validation("offset_vectors", "must not be empty"));
  }
  let mut seen_vectors = BTreeSet::new();
  let mut vectors = Vec::with_capacity(raw.offset_vectors.len());
  for vector in &raw.offset_vectors {
    if vector.id.is_empty() {
      return Err(EngineError::validation("offset_vectors[].id", "must not be empty"));
    }
    if !seen_vectors.insert(vector.id.clone()) {
      return Err(EngineError::validation("offset_vectors[].id", "duplicate vector id"));
    }
    if vector.shifts.is_empty() {
      return Err(EngineError::validation(
        "offset_vectors[].shifts",
        "must name at least one detector",
      ));
    }
    let mut shifts = HashMap::with_capacity(vector.shifts.len());
    for (detector, secs) in &vector.shifts {
      require_finite("offset_vectors[].shifts", *secs)?;
      shifts.insert(detector.clone(), secs_to_duration(*secs));
    }
    vectors.push(OffsetVector {
      id: vector.id.clone(),
      shifts,
    });
  }

  let defaults = Config::default();
  let window_secs = raw.window_secs.unwrap_or(defaults.window_secs);
  require_non_negative("window_secs", window_secs)?;

  let min_instruments = raw.min_instruments.unwrap_or(defaults.min_instruments);
  if min_instruments == 0 {
    return Err(EngineError::validation("min_instruments", "must be at least 1"));
  }

  let policy = match &raw.policy {
    Some(name) => PolicyKind::from_str_loose(name).ok_or_else(|| {
      EngineError::validation("policy", "expected fixed_window|interval_overlap")
    })?,
    None => defaults.policy,
  };

  Ok((
    sites,
    vectors,
    Config {
      policy,
      window_secs,
      min_instruments,
    },
  ))
}
