//! Driver: partitions the inbound stream by detector, feeds the graph in
//! timestamp-ascending batches, and drains completed groups through the
//! assembler into the sink.

use log::{debug, info};
use std::collections::BTreeMap;

use crate::assemble::{assemble, CombinerFn, VetoFn};
use crate::config::Config;
use crate::error::EngineError;
use crate::geometry::{DelayTable, DetectorSite};
use crate::graph::TimeSlideGraph;
use crate::matcher::build_policy;
use crate::types::{CombinedRecord, Event, OffsetVector, RunStats};

/// Receives completed records; append-only. Ordering across different
/// offset vectors is not guaranteed.
pub trait RecordSink {
  fn append(&mut self, record: &CombinedRecord) -> Result<(), EngineError>;
}

/// In-memory sink for tests and small runs.
#[derive(Debug, Default)]
pub struct VecSink(pub Vec<CombinedRecord>);

impl RecordSink for VecSink {
  fn append(&mut self, record: &CombinedRecord) -> Result<(), EngineError> {
    self.0.push(record.clone());
    Ok(())
  }
}

/// Wires timelines, matcher, graph and assembler together for one run.
pub struct Driver {
  graph: TimeSlideGraph,
  veto: Option<Box<VetoFn>>,
  combiner: Option<Box<CombinerFn>>,
  stats: RunStats,
}

impl Driver {
  /// Build the search: pairwise propagation delays are derived once from
  /// the static site table, the policy comes from config, and the graph
  /// gets one node per offset vector.
  pub fn new(
    sites: &[DetectorSite],
    vectors: Vec<OffsetVector>,
    config: &Config,
  ) -> Result<Self, EngineError> {
    let delays = DelayTable::from_sites(sites);
    let policy = build_policy(config);
    debug!(
      "wiring {} policy over {} offset vector(s), min instruments {}",
      policy.name(),
      vectors.len(),
      config.min_instruments
    );
    let graph = TimeSlideGraph::new(vectors, policy, delays, config.min_instruments)?;
    Ok(Self {
      graph,
      veto: None,
      combiner: None,
      stats: RunStats::default(),
    })
  }

  pub fn with_veto(mut self, veto: Box<VetoFn>) -> Self {
    self.veto = Some(veto);
    self
  }

  pub fn with_combiner(mut self, combiner: Box<CombinerFn>) -> Self {
    self.combiner = Some(combiner);
    self
  }

  /// Ingest one batch: partition by detector, sort each partition ascending
  /// by peak time, push with the partition's newest peak as the
  /// completeness bound.
  pub fn ingest(&mut self, batch: Vec<Event>) -> Result<(), EngineError> {
    if batch.is_empty() {
      return Ok(());
    }
    let mut partitions: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for event in batch {
      self.stats.events += 1;
      partitions.entry(event.detector.clone()).or_default().push(event);
    }
    for (detector, mut events) in partitions {
      events.sort_by_key(|e| e.peak);
      let Some(last) = events.last() else { continue };
      let bound = last.peak;
      self.graph.push(&detector, events, bound)?;
    }
    Ok(())
  }

  /// Drain completed groups through the assembler into the sink. Returns
  /// the number of records written.
  pub fn drain<S: RecordSink>(&mut self, sink: &mut S, flush: bool) -> Result<usize, EngineError> {
    let veto = self.veto.as_deref();
    let combiner = self.combiner.as_deref();
    let mut written = 0;
    for group in self.graph.pull(flush) {
      self.stats.groups += 1;
      match assemble(&group, veto, combiner)? {
        Some(record) => {
          sink.append(&record)?;
          self.stats.records += 1;
          written += 1;
        }
        None => {
          self.stats.vetoed += 1;
        }
      }
    }
    Ok(written)
  }

  /// End of stream: flush every remaining complete group.
  pub fn finish<S: RecordSink>(&mut self, sink: &mut S) -> Result<RunStats, EngineError> {
    self.drain(sink, true)?;
    info!(
      "run complete: {} event(s), {} group(s), {} vetoed, {} record(s)",
      self.stats.events, self.stats.groups, self.stats.vetoed, self.stats.records
    );
    Ok(self.stats.clone())
  }

  pub fn stats(&self) -> &RunStats {
    &self.stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assemble::{forbid_detector_set, snr_weighted};
  use crate::types::secs_to_duration;
  use chrono::{DateTime, TimeZone, Utc};
  use std::collections::BTreeSet;

  fn t(secs: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + secs_to_duration(secs)
  }

  fn ev(detector: &str, secs: f64) -> Event {
    Event {
      id: String::new(),
      detector: detector.into(),
      peak: t(secs),
      start: t(secs),
      duration: 0.0,
      central_freq: 100.0,
      bandwidth: 20.0,
      snr: 5.0,
      confidence: 1.0,
      amplitude: 1.0,
    }
  }

  fn sites(detectors: &[&str]) -> Vec<DetectorSite> {
    detectors
      .iter()
      .map(|&d| DetectorSite { id: d.into(), position: [0.0, 0.0, 0.0] })
      .collect()
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

  fn config(window: f64, min_instruments: usize) -> Config {
    Config {
      window_secs: window,
      min_instruments,
      ..Config::default()
    }
  }

  #[test]
  fn end_to_end_pair_produces_one_record() {
    let mut driver = Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 2))
      .unwrap()
      .with_combiner(Box::new(snr_weighted));
    let mut sink = VecSink::default();

    driver.ingest(vec![ev("A", 0.0), ev("B", 0.5)]).unwrap();
    let stats = driver.finish(&mut sink).unwrap();

    assert_eq!(sink.0.len(), 1);
    assert_eq!(sink.0[0].instruments, vec!["A", "B"]);
    assert!(sink.0[0].combined.is_some());
    assert_eq!(stats.events, 2);
    assert_eq!(stats.records, 1);
    assert_eq!(stats.vetoed, 0);
  }

  #[test]
  fn exact_set_veto_suppresses_the_pair_but_not_the_triple() {
    let forbidden = BTreeSet::from(["A".to_string(), "B".to_string()]);

    // Pair {A, B}: vetoed.
    let mut driver = Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 2))
      .unwrap()
      .with_veto(forbid_detector_set(forbidden.clone()));
    let mut sink = VecSink::default();
    driver.ingest(vec![ev("A", 0.0), ev("B", 0.5)]).unwrap();
    let stats = driver.finish(&mut sink).unwrap();
    assert!(sink.0.is_empty());
    assert_eq!(stats.vetoed, 1);

    // Triple {A, B, C} with the same pair inside: survives.
    let mut driver = Driver::new(
      &sites(&["A", "B", "C"]),
      vec![zero_vector(&["A", "B", "C"])],
      &config(1.0, 2),
    )
    .unwrap()
    .with_veto(forbid_detector_set(forbidden));
    let mut sink = VecSink::default();
    driver.ingest(vec![ev("A", 0.0), ev("B", 0.5), ev("C", 0.7)]).unwrap();
    driver.finish(&mut sink).unwrap();
    assert_eq!(sink.0.len(), 1);
    assert_eq!(sink.0[0].instruments, vec!["A", "B", "C"]);
  }

  #[test]
  fn unsorted_batch_is_partitioned_and_sorted_before_push() {
    let mut driver =
      Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 2)).unwrap();
    let mut sink = VecSink::default();
    // Interleaved detectors, out of order within the batch.
    driver
      .ingest(vec![ev("B", 0.5), ev("A", 3.0), ev("A", 0.0), ev("B", 3.2)])
      .unwrap();
    driver.finish(&mut sink).unwrap();
    assert_eq!(sink.0.len(), 2);
  }

  #[test]
  fn regressing_batches_surface_out_of_order() {
    let mut driver =
      Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 2)).unwrap();
    driver.ingest(vec![ev("A", 5.0)]).unwrap();
    let err = driver.ingest(vec![ev("A", 4.0)]).unwrap_err();
    assert!(matches!(err, EngineError::OutOfOrder { .. }));
  }

  #[test]
  fn veto_error_propagates_and_commits_nothing() {
    let mut driver = Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 2))
      .unwrap()
      .with_veto(Box::new(|_, _| Err(EngineError::external("veto: broken"))));
    let mut sink = VecSink::default();
    driver.ingest(vec![ev("A", 0.0), ev("B", 0.5)]).unwrap();
    let err = driver.finish(&mut sink).unwrap_err();
    assert_eq!(err.to_string(), "veto: broken");
    assert!(sink.0.is_empty());
  }

  #[test]
  fn propagation_delay_widens_the_pair_window() {
    // B sits one light-second away; with a 0.1 s window the 0.6 s peak
    // separation only matches because of the delay allowance.
    let sites = vec![
      DetectorSite { id: "A".into(), position: [0.0, 0.0, 0.0] },
      DetectorSite { id: "B".into(), position: [299_792_458.0, 0.0, 0.0] },
    ];
    let mut driver =
      Driver::new(&sites, vec![zero_vector(&["A", "B"])], &config(0.1, 2)).unwrap();
    let mut sink = VecSink::default();
    driver.ingest(vec![ev("A", 0.0), ev("B", 0.6)]).unwrap();
    driver.finish(&mut sink).unwrap();
    assert_eq!(sink.0.len(), 1);
  }

  #[test]
  fn min_instruments_one_emits_isolated_singles() {
    let mut driver =
      Driver::new(&sites(&["A", "B"]), vec![zero_vector(&["A", "B"])], &config(1.0, 1)).unwrap();
    let mut sink = VecSink::default();
    driver.ingest(vec![ev("A", 0.0), ev("B", 2.0)]).unwrap();
    driver.finish(&mut sink).unwrap();
    assert_eq!(sink.0.len(), 2);
    assert!(sink.0.iter().all(|r| r.instruments.len() == 1));
  }
}
