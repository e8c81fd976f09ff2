//! Binary entrypoint: read a one-line JSON run setup, then event JSON lines,
//! from stdin; write JSON lines to stdout.
//!
//! Output lines are either:
//! - A CombinedRecord (one per surviving coincidence group)
//! - An ErrorOutput (when an input line fails to parse or validate)
//!
//! Malformed event lines are reported and skipped. Ordering-contract
//! violations (events behind an already-advanced bound) are fatal: the
//! match set would be incomplete, so the process exits nonzero.

use coincidence_engine::assemble::snr_weighted;
use coincidence_engine::normalize;
use coincidence_engine::types::{ErrorOutput, InboundEvent, InboundSetup};
use coincidence_engine::{Driver, EngineError, Event, RecordSink};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

const BATCH_LINES: usize = 512;

struct JsonLinesSink<W: Write>(W);

impl<W: Write> JsonLinesSink<W> {
  fn write_line<T: serde::Serialize>(&mut self, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut self.0, value)?;
    writeln!(self.0)
  }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
  fn append(&mut self, record: &coincidence_engine::CombinedRecord) -> Result<(), EngineError> {
    self.write_line(record).map_err(|e| EngineError::sink(e.to_string()))
  }
}

fn error_line(e: &EngineError) -> ErrorOutput {
  match e {
    EngineError::Validation { field, reason } => {
      ErrorOutput::new(reason.clone()).with_field(field.clone())
    }
    _ => ErrorOutput::new(e.to_string()),
  }
}

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
    .target(env_logger::Target::Stderr)
    .init();

  let stdin = io::stdin();
  let stdout = io::stdout();
  let mut lines = stdin.lock().lines();
  let mut out = JsonLinesSink(io::BufWriter::new(stdout.lock()));

  // First non-blank line configures the run; without it nothing can proceed.
  let setup: InboundSetup = loop {
    let Some(line) = lines.next() else {
      let _ = writeln!(io::stderr(), "coincidence-engine: no setup line on stdin");
      std::process::exit(1);
    };
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        let _ = writeln!(io::stderr(), "coincidence-engine: read error: {}", e);
        std::process::exit(1);
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    match serde_json::from_str(trimmed) {
      Ok(setup) => break setup,
      Err(e) => {
        let _ = out.write_line(&ErrorOutput::new(format!("setup parse: {}", e)));
        let _ = out.0.flush();
        std::process::exit(1);
      }
    }
  };

  let (sites, vectors, config) = match normalize::normalize_setup(&setup) {
    Ok(parts) => parts,
    Err(e) => {
      let _ = out.write_line(&error_line(&e));
      let _ = out.0.flush();
      std::process::exit(1);
    }
  };

  let mut driver = match Driver::new(&sites, vectors, &config) {
    Ok(driver) => driver.with_combiner(Box::new(snr_weighted)),
    Err(e) => {
      let _ = out.write_line(&error_line(&e));
      let _ = out.0.flush();
      std::process::exit(1);
    }
  };
  if !setup.forbidden_sets.is_empty() {
    let forbidden: Vec<BTreeSet<String>> = setup
      .forbidden_sets
      .iter()
      .map(|set| set.iter().cloned().collect())
      .collect();
    driver = driver.with_veto(Box::new(move |members, _vector| {
      let detectors: BTreeSet<String> = members.iter().map(|m| m.detector.clone()).collect();
      Ok(forbidden.iter().any(|set| *set == detectors))
    }));
  }

  let mut batch: Vec<Event> = Vec::with_capacity(BATCH_LINES);
  for line in lines {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        let _ = writeln!(io::stderr(), "coincidence-engine: read error: {}", e);
        std::process::exit(1);
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    // Parse + validate the inbound event; bad lines are reported, not fatal.
    let raw: InboundEvent = match serde_json::from_str(trimmed) {
      Ok(raw) => raw,
      Err(e) => {
        let _ = out.write_line(&ErrorOutput::new(format!("json parse: {}", e)));
        continue;
      }
    };
    match normalize::normalize_event(&raw) {
      Ok(event) => batch.push(event),
      Err(e) => {
        let _ = out.write_line(&error_line(&e));
        continue;
      }
    }

    if batch.len() >= BATCH_LINES {
      if let Err(e) = feed(&mut driver, &mut batch, &mut out) {
        let _ = out.write_line(&error_line(&e));
        let _ = out.0.flush();
        std::process::exit(1);
      }
    }
  }

  // End of stream: ingest the remainder and flush every complete group.
  let result = feed(&mut driver, &mut batch, &mut out).and_then(|_| driver.finish(&mut out));
  match result {
    Ok(stats) => {
      log::info!(
        "done: {} event(s) in, {} record(s) out",
        stats.events,
        stats.records
      );
    }
    Err(e) => {
      let _ = out.write_line(&error_line(&e));
      let _ = out.0.flush();
      std::process::exit(1);
    }
  }

  let _ = out.0.flush();
}

fn feed<W: Write>(
  driver: &mut Driver,
  batch: &mut Vec<Event>,
  out: &mut JsonLinesSink<W>,
) -> Result<(), EngineError> {
  driver.ingest(std::mem::take(batch))?;
  driver.drain(out, false)?;
  Ok(())
}
