//! Streaming multi-detector coincidence search — deterministic, rule-based.
//!
//! Ingests per-detector timestamped events, matches them pairwise inside
//! bisection windows, assembles mutually coincident groups across detectors
//! for every configured time-slide offset vector, and emits one combined
//! record per surviving group.
//!
//! No DB, no network; pure computation + in-memory state.

pub mod assemble;
pub mod config;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod matcher;
pub mod normalize;
pub mod timeline;
pub mod types;

pub use config::{Config, PolicyKind};
pub use driver::{Driver, RecordSink, VecSink};
pub use error::EngineError;
pub use graph::TimeSlideGraph;
pub use types::{CandidateGroup, CombinedRecord, Event, OffsetVector};
