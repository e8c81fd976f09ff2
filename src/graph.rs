//! Time-slide graph: combinatorial coincidence search over per-detector
//! timelines, streamed behind per-vector watermarks.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::EngineError;
use crate::geometry::DelayTable;
use crate::matcher::{matches, MatchPolicy};
use crate::timeline::Timeline;
use crate::types::{CandidateGroup, Event, GroupMember, OffsetVector};

/// Search state for one offset vector.
struct SlideNode {
  vector: OffsetVector,
  /// The vector's detectors in the fixed search ordering.
  detectors: Vec<String>,
  /// Groups whose defining time precedes this have already been emitted.
  emitted_before: DateTime<Utc>,
}

/// The coincidence engine: one node per offset vector over shared
/// per-detector timelines.
///
/// `push` ingests events and completeness bounds; `pull` streams every
/// newly finalized candidate group. Groups are tuples of mutually
/// coincident events, at most one per detector, kept only when no further
/// event could extend them (maximality) and the minimum instrument count
/// is met.
pub struct TimeSlideGraph {
  policy: Box<dyn MatchPolicy>,
  delays: DelayTable,
  min_instruments: usize,
  timelines: HashMap<String, Timeline>,
  nodes: Vec<SlideNode>,
  max_abs_shift: Duration,
}

impl TimeSlideGraph {
  pub fn new(
    vectors: Vec<OffsetVector>,
    policy: Box<dyn MatchPolicy>,
    delays: DelayTable,
    min_instruments: usize,
  ) -> Result<Self, EngineError> {
    if min_instruments == 0 {
      return Err(EngineError::validation("min_instruments", "must be at least 1"));
    }
    if vectors.is_empty() {
      return Err(EngineError::validation("offset_vectors", "must not be empty"));
    }

    let mut seen = BTreeSet::new();
    let mut max_abs_shift = Duration::zero();
    let mut nodes = Vec::with_capacity(vectors.len());
    for vector in vectors {
      if vector.id.is_empty() {
        return Err(EngineError::validation("offset_vectors[].id", "must not be empty"));
      }
      if !seen.insert(vector.id.clone()) {
        return Err(EngineError::validation("offset_vectors[].id", "duplicate vector id"));
      }
      if vector.shifts.is_empty() {
        return Err(EngineError::validation(
          "offset_vectors[].shifts",
          "must name at least one detector",
        ));
      }
      for shift in vector.shifts.values() {
        max_abs_shift = max_abs_shift.max(shift.abs());
      }
      let detectors = vector.detectors();
      nodes.push(SlideNode {
        vector,
        detectors,
        emitted_before: DateTime::<Utc>::MIN_UTC,
      });
    }

    Ok(Self {
      policy,
      delays,
      min_instruments,
      timelines: HashMap::new(),
      nodes,
      max_abs_shift,
    })
  }

  pub fn timeline(&self, detector: &str) -> Option<&Timeline> {
    self.timelines.get(detector)
  }

  /// Ingest one detector's batch and advance its completeness bound.
  ///
  /// Events behind the detector's previously advanced bound are refused
  /// before anything is appended. A batch may be empty: that only moves
  /// the bound (and therefore the watermark) forward.
  pub fn push(
    &mut self,
    detector: &str,
    events: Vec<Event>,
    bound: DateTime<Utc>,
  ) -> Result<(), EngineError> {
    let timeline = self
      .timelines
      .entry(detector.to_string())
      .or_insert_with(|| Timeline::new(detector));

    if events.iter().any(|e| e.detector != detector) {
      return Err(EngineError::validation(
        "detector",
        "event detector does not match push partition",
      ));
    }
    if let Some(prev) = timeline.bound() {
      if let Some(stale) = events.iter().find(|e| e.peak < prev) {
        return Err(EngineError::OutOfOrder {
          detector: detector.to_string(),
          timestamp: stale.peak,
          bound: prev,
        });
      }
    }

    let count = events.len();
    for event in events {
      timeline.append(event)?;
    }
    timeline.advance(bound)?;
    self.policy.reindex(detector, timeline);
    debug!("push: {} event(s) on {}, bound {}", count, detector, bound);
    Ok(())
  }

  /// Stream newly finalized candidate groups.
  ///
  /// The iterator scans one offset vector at a time. Each vector's
  /// watermark advances to the point below which no future push can add or
  /// extend a group, and groups defined in the newly finalized interval are
  /// yielded exactly once. `flush` finalizes everything that remains (end
  /// of stream); it never emits a group still eligible for extension,
  /// because nothing further can arrive.
  pub fn pull(&mut self, flush: bool) -> PullIter<'_> {
    self.trim_timelines();
    PullIter {
      graph: self,
      flush,
      cursor: 0,
      pending: VecDeque::new(),
    }
  }

  /// Largest half-window any pair test can currently require.
  fn horizon(&self) -> Duration {
    self.policy.horizon() + self.delays.max_delay()
  }

  /// Watermark for one vector: groups defined strictly before it are
  /// final. The minimum shifted bound across the vector's detectors backs
  /// off by the horizon; a detector that has never pushed pins the
  /// watermark (nothing is provably final until flush). Never regresses,
  /// even if the policy's horizon has since grown.
  fn node_watermark(&self, node: &SlideNode, flush: bool) -> DateTime<Utc> {
    if flush {
      return DateTime::<Utc>::MAX_UTC;
    }
    let mut completed = DateTime::<Utc>::MAX_UTC;
    for detector in &node.detectors {
      let bound = self.timelines.get(detector).and_then(|t| t.bound());
      let Some(bound) = bound else {
        return node.emitted_before;
      };
      completed = completed.min(bound + node.vector.shift(detector));
    }
    (completed - self.horizon()).max(node.emitted_before)
  }

  /// Drop events that can no longer participate in any unseen group, nor
  /// witness a maximality check for one.
  fn trim_timelines(&mut self) {
    let Some(oldest) = self.nodes.iter().map(|n| n.emitted_before).min() else {
      return;
    };
    if oldest == DateTime::<Utc>::MIN_UTC {
      return;
    }
    let floor = oldest - (self.horizon() * 2 + self.max_abs_shift);
    for timeline in self.timelines.values_mut() {
      timeline.trim(floor);
    }
  }

  /// All maximal mutually coincident tuples for `node` whose defining time
  /// lies in `[lo, hi)`.
  fn enumerate_groups(
    &self,
    node: &SlideNode,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
  ) -> Vec<CandidateGroup> {
    if lo >= hi {
      return Vec::new();
    }

    // Tuples of (detector slot, event index), grown detector-by-detector in
    // the fixed ordering so each detector subset is enumerated exactly once.
    let mut tuples: Vec<Vec<(usize, u64)>> = Vec::new();
    for root in 0..node.detectors.len() {
      let Some(timeline) = self.timelines.get(&node.detectors[root]) else {
        continue;
      };
      for (index, _) in timeline.iter() {
        self.extend(node, vec![(root, index)], root + 1, &mut tuples);
      }
    }

    let mut groups = Vec::new();
    for tuple in tuples {
      if tuple.len() < self.min_instruments {
        continue;
      }
      let Some(time) = self.tuple_time(node, &tuple) else {
        continue;
      };
      if !(lo <= time && time < hi) {
        continue;
      }
      if !self.is_maximal(node, &tuple) {
        continue;
      }
      if let Some(group) = self.resolve(node, &tuple) {
        groups.push(group);
      }
    }
    groups
  }

  /// Depth-first growth: every partial tuple is itself a candidate; each
  /// later detector contributes every event that is coincident with all
  /// current members.
  fn extend(
    &self,
    node: &SlideNode,
    members: Vec<(usize, u64)>,
    next: usize,
    tuples: &mut Vec<Vec<(usize, u64)>>,
  ) {
    for slot in next..node.detectors.len() {
      for index in self.mutual_matches(node, &members, slot) {
        let mut grown = members.clone();
        grown.push((slot, index));
        self.extend(node, grown, slot + 1, tuples);
      }
    }
    tuples.push(members);
  }

  /// Events of detector `slot` coincident with every member of the partial
  /// tuple: the root member's bisection window prunes the timeline, then
  /// the exact pairwise test against each remaining member enforces full
  /// mutual coincidence (not just chain coincidence).
  fn mutual_matches(&self, node: &SlideNode, members: &[(usize, u64)], slot: usize) -> Vec<u64> {
    let target = &node.detectors[slot];
    let Some(timeline) = self.timelines.get(target) else {
      return Vec::new();
    };
    let Some(&(root_slot, root_index)) = members.first() else {
      return Vec::new();
    };
    let root_detector = &node.detectors[root_slot];
    let Some(root) = self.timelines.get(root_detector).and_then(|t| t.get(root_index)) else {
      return Vec::new();
    };

    let rel_offset = node.vector.shift(root_detector) - node.vector.shift(target);
    let delay = self.delays.get(root_detector, target);
    matches(self.policy.as_ref(), root, rel_offset, timeline, delay)
      .into_iter()
      .filter(|(_, candidate)| {
        members[1..].iter().all(|&(member_slot, member_index)| {
          let member_detector = &node.detectors[member_slot];
          let Some(member) = self
            .timelines
            .get(member_detector)
            .and_then(|t| t.get(member_index))
          else {
            return false;
          };
          let rel = node.vector.shift(member_detector) - node.vector.shift(target);
          self
            .policy
            .coincident(member, rel, candidate, self.delays.get(member_detector, target))
        })
      })
      .map(|(index, _)| index)
      .collect()
  }

  /// A tuple is maximal when no event of a non-member detector is
  /// coincident with every member; only maximal tuples become groups, so
  /// subsets of an emitted group are suppressed.
  fn is_maximal(&self, node: &SlideNode, tuple: &[(usize, u64)]) -> bool {
    let used: BTreeSet<usize> = tuple.iter().map(|&(slot, _)| slot).collect();
    for slot in 0..node.detectors.len() {
      if used.contains(&slot) {
        continue;
      }
      if !self.mutual_matches(node, tuple, slot).is_empty() {
        return false;
      }
    }
    true
  }

  /// Defining time: the latest shifted member peak.
  fn tuple_time(&self, node: &SlideNode, tuple: &[(usize, u64)]) -> Option<DateTime<Utc>> {
    tuple
      .iter()
      .filter_map(|&(slot, index)| {
        let detector = &node.detectors[slot];
        self
          .timelines
          .get(detector)
          .and_then(|t| t.get(index))
          .map(|e| e.peak + node.vector.shift(detector))
      })
      .max()
  }

  fn resolve(&self, node: &SlideNode, tuple: &[(usize, u64)]) -> Option<CandidateGroup> {
    let mut members = Vec::with_capacity(tuple.len());
    for &(slot, index) in tuple {
      let detector = &node.detectors[slot];
      let event = self.timelines.get(detector).and_then(|t| t.get(index))?;
      members.push(GroupMember {
        detector: detector.clone(),
        event: event.clone(),
      });
    }
    Some(CandidateGroup {
      vector: node.vector.clone(),
      members,
    })
  }
}

/// Lazy stream of newly finalized groups; created by
/// [`TimeSlideGraph::pull`]. Holds a cursor over the offset vectors and a
/// buffer for the vector currently being scanned; restartable only via a
/// fresh `pull` after further pushes.
pub struct PullIter<'a> {
  graph: &'a mut TimeSlideGraph,
  flush: bool,
  cursor: usize,
  pending: VecDeque<CandidateGroup>,
}

impl Iterator for PullIter<'_> {
  type Item = CandidateGroup;

  fn next(&mut self) -> Option<CandidateGroup> {
    loop {
      if let Some(group) = self.pending.pop_front() {
        return Some(group);
      }
      if self.cursor >= self.graph.nodes.len() {
        return None;
      }
      let index = self.cursor;
      self.cursor += 1;

      let (watermark, groups) = {
        let node = &self.graph.nodes[index];
        let watermark = self.graph.node_watermark(node, self.flush);
        let groups = self.graph.enumerate_groups(node, node.emitted_before, watermark);
        (watermark, groups)
      };
      if !groups.is_empty() {
        debug!(
          "pull: vector {}: {} group(s) finalized before {}",
          self.graph.nodes[index].vector.id,
          groups.len(),
          watermark
        );
      }
      self.graph.nodes[index].emitted_before = watermark;
      self.pending.extend(groups);
    }
  }
}
