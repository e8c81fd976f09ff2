//! Per-detector event timeline: a sorted buffer with stable arena indices.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::error::EngineError;
use crate::types::Event;

/// Sorted per-detector buffer of events.
///
/// Events are addressed by global indices that survive trimming: `base` is
/// the global index of the front slot, and `trim` advances it as finalized
/// events are dropped, so candidate groups can hold indices instead of
/// references while the buffer shrinks from the front.
#[derive(Debug)]
pub struct Timeline {
  detector: String,
  events: VecDeque<Event>,
  base: u64,
  bound: Option<DateTime<Utc>>,
}

impl Timeline {
  pub fn new(detector: impl Into<String>) -> Self {
    Self {
      detector: detector.into(),
      events: VecDeque::new(),
      base: 0,
      bound: None,
    }
  }

  pub fn detector(&self) -> &str {
    &self.detector
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  /// The caller's completeness promise: no future event precedes this.
  pub fn bound(&self) -> Option<DateTime<Utc>> {
    self.bound
  }

  /// Insert preserving peak-time order.
  ///
  /// Input is expected near-sorted, so in-order arrivals append in O(1);
  /// stragglers pay a bisection plus shift. Events behind the advanced bound
  /// are refused. Assigns an id when the event carries none, and returns the
  /// event's global index at insertion time.
  pub fn append(&mut self, mut event: Event) -> Result<u64, EngineError> {
    if let Some(bound) = self.bound {
      if event.peak < bound {
        return Err(EngineError::OutOfOrder {
          detector: self.detector.clone(),
          timestamp: event.peak,
          bound,
        });
      }
    }

    // base + len counts every event ever appended, so it never repeats.
    let sequence = self.base + self.events.len() as u64;
    if event.id.is_empty() {
      event.id = format!("{}:{}", self.detector, sequence);
    }

    match self.events.back() {
      Some(last) if last.peak > event.peak => {
        let at = self.events.partition_point(|e| e.peak <= event.peak);
        self.events.insert(at, event);
        Ok(self.base + at as u64)
      }
      _ => {
        self.events.push_back(event);
        Ok(sequence)
      }
    }
  }

  /// All events with peak time in `[lo, hi]`, with their global indices.
  /// Two bisections bound the scan: O(log n + k).
  pub fn range_query(
    &self,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
  ) -> impl Iterator<Item = (u64, &Event)> + '_ {
    let from = self.events.partition_point(|e| e.peak < lo);
    let to = self.events.partition_point(|e| e.peak <= hi).max(from);
    let base = self.base;
    self
      .events
      .range(from..to)
      .enumerate()
      .map(move |(i, e)| (base + (from + i) as u64, e))
  }

  pub fn get(&self, index: u64) -> Option<&Event> {
    let slot = index.checked_sub(self.base)?;
    self.events.get(slot as usize)
  }

  pub fn iter(&self) -> impl Iterator<Item = (u64, &Event)> + '_ {
    let base = self.base;
    self.events.iter().enumerate().map(move |(i, e)| (base + i as u64, e))
  }

  /// Record that no future event for this detector precedes `bound`.
  /// Bound regressions are contract violations.
  pub fn advance(&mut self, bound: DateTime<Utc>) -> Result<(), EngineError> {
    if let Some(prev) = self.bound {
      if bound < prev {
        return Err(EngineError::OutOfOrder {
          detector: self.detector.clone(),
          timestamp: bound,
          bound: prev,
        });
      }
    }
    self.bound = Some(bound);
    Ok(())
  }

  /// Drop events with peak time before `before`; surviving indices keep
  /// their values because the base advances with the front.
  pub fn trim(&mut self, before: DateTime<Utc>) {
    while let Some(front) = self.events.front() {
      if front.peak >= before {
        break;
      }
      self.events.pop_front();
      self.base += 1;
    }
  }
}
