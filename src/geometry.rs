//! Detector geometry: site positions and cached pairwise propagation delays.

use chrono::Duration;
use std::collections::HashMap;

use crate::types::secs_to_duration;

/// Vacuum speed of light, meters per second.
const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// A detector site at a fixed geocentric position (meters).
#[derive(Debug, Clone)]
pub struct DetectorSite {
  pub id: String,
  pub position: [f64; 3],
}

/// Symmetric table of maximum propagation delays per unordered detector
/// pair, built once at startup and passed by reference.
///
/// Identical or unknown detectors have zero delay.
#[derive(Debug, Clone)]
pub struct DelayTable {
  delays: HashMap<(String, String), Duration>,
  max: Duration,
}

impl Default for DelayTable {
  fn default() -> Self {
    Self {
      delays: HashMap::new(),
      max: Duration::zero(),
    }
  }
}

impl DelayTable {
  /// Derive every pairwise delay from the static site table.
  pub fn from_sites(sites: &[DetectorSite]) -> Self {
    let mut table = Self::default();
    for (i, a) in sites.iter().enumerate() {
      for b in &sites[i + 1..] {
        let secs = distance(a.position, b.position) / SPEED_OF_LIGHT;
        table.insert(&a.id, &b.id, secs_to_duration(secs));
      }
    }
    table
  }

  pub fn insert(&mut self, a: &str, b: &str, delay: Duration) {
    if delay > self.max {
      self.max = delay;
    }
    self.delays.insert(pair_key(a, b), delay);
  }

  pub fn get(&self, a: &str, b: &str) -> Duration {
    if a == b {
      return Duration::zero();
    }
    self.delays.get(&pair_key(a, b)).copied().unwrap_or_else(Duration::zero)
  }

  /// Largest delay in the table; part of the watermark horizon.
  pub fn max_delay(&self) -> Duration {
    self.max
  }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
  if a <= b {
    (a.to_string(), b.to_string())
  } else {
    (b.to_string(), a.to_string())
  }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
  let dx = a[0] - b[0];
  let dy = a[1] - b[1];
  let dz = a[2] - b[2];
  (dx * dx + dy * dy + dz * dz).sqrt()
}
