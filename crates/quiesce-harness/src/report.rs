//! Structured JSONL run records.
//!
//! Every stress run produces one [`RunRecord`], serialised as a single JSON
//! line. Lines append cleanly to a shared log file, and
//! [`validate_line`] lets downstream tooling (and our own tests) check a
//! log without re-running anything.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::stress::{StressConfig, StressOutcome};

/// Verdict of a single stress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Canonical record of one stress run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub scenario: String,
    pub secs: f64,
    pub workers: usize,
    pub reader_loops: u64,
    pub writer_loops: u64,
    pub retired: u64,
    pub reclaimed: u64,
    pub violations: u64,
    pub outcome: Outcome,
}

impl RunRecord {
    /// Build a record from a finished run. The run passes iff no reader
    /// observed a destroyed pointer and every retired pointer was
    /// reclaimed by the final drain.
    pub fn new(scenario: &str, config: &StressConfig, result: &StressOutcome) -> Self {
        let pass = result.violations == 0 && result.retired == result.reclaimed;
        Self {
            scenario: scenario.to_string(),
            secs: config.duration.as_secs_f64(),
            workers: config.workers,
            reader_loops: result.reader_loops,
            writer_loops: result.writer_loops,
            retired: result.retired,
            reclaimed: result.reclaimed,
            violations: result.violations,
            outcome: if pass { Outcome::Pass } else { Outcome::Fail },
        }
    }
}

/// Writes one JSON object per line to stdout or a log file.
pub struct Emitter {
    out: Box<dyn Write>,
}

impl Emitter {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(io::stdout()),
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn to_path(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Box::new(file),
        })
    }

    pub fn emit(&mut self, record: &RunRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }
}

/// Parse and validate a single JSONL line.
pub fn validate_line(line: &str) -> Result<RunRecord, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample() -> RunRecord {
        let config = StressConfig::new(Duration::from_secs(1), Some(4));
        let outcome = StressOutcome {
            reader_loops: 1000,
            writer_loops: 100,
            retired: 40,
            reclaimed: 40,
            violations: 0,
        };
        RunRecord::new("ebr", &config, &outcome)
    }

    #[test]
    fn record_round_trips_through_a_line() {
        let record = sample();
        let line = serde_json::to_string(&record).unwrap();
        let parsed = validate_line(&line).unwrap();
        assert_eq!(parsed.scenario, "ebr");
        assert_eq!(parsed.workers, 4);
        assert_eq!(parsed.retired, 40);
        assert_eq!(parsed.outcome, Outcome::Pass);
    }

    #[test]
    fn violations_fail_the_run() {
        let config = StressConfig::new(Duration::from_secs(1), Some(4));
        let outcome = StressOutcome {
            violations: 1,
            ..StressOutcome::default()
        };
        let record = RunRecord::new("qsbr", &config, &outcome);
        assert_eq!(record.outcome, Outcome::Fail);
    }

    #[test]
    fn unreclaimed_retires_fail_the_run() {
        let config = StressConfig::new(Duration::from_secs(1), Some(4));
        let outcome = StressOutcome {
            retired: 10,
            reclaimed: 9,
            ..StressOutcome::default()
        };
        let record = RunRecord::new("gc", &config, &outcome);
        assert_eq!(record.outcome, Outcome::Fail);
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(validate_line("not json").is_err());
        assert!(validate_line("{\"scenario\": \"ebr\"}").is_err());
    }
}
