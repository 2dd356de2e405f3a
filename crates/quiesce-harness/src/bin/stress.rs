//! CLI entrypoint for the quiesce stress harness.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use quiesce_harness::report::{Emitter, Outcome, RunRecord};
use quiesce_harness::stress::{self, Scenario, StressConfig};

/// Reclamation stress driver.
#[derive(Debug, Parser)]
#[command(name = "stress")]
#[command(about = "Stress the quiesce reclamation primitives")]
struct Cli {
    /// Seconds to run each selected scenario.
    #[arg(long, default_value_t = 10)]
    secs: u64,
    /// Total worker count including the writer (default: one reader per
    /// CPU, plus the writer).
    #[arg(long)]
    threads: Option<usize>,
    /// Append JSONL run records to this file instead of stdout.
    #[arg(long)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Epoch-based reclamation scenario.
    Ebr,
    /// Quiescent-state-based reclamation scenario.
    Qsbr,
    /// Deferred-reclamation collector scenario.
    Gc,
    /// Every scenario, in sequence.
    All,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let scenarios: &[Scenario] = match cli.command {
        Command::Ebr => &[Scenario::Ebr],
        Command::Qsbr => &[Scenario::Qsbr],
        Command::Gc => &[Scenario::Gc],
        Command::All => &[Scenario::Ebr, Scenario::Qsbr, Scenario::Gc],
    };

    let mut emitter = match &cli.log {
        Some(path) => match Emitter::to_path(path) {
            Ok(emitter) => emitter,
            Err(err) => {
                eprintln!("stress: cannot open {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Emitter::stdout(),
    };

    let mut failed = false;
    for &scenario in scenarios {
        let config = StressConfig::new(Duration::from_secs(cli.secs), cli.threads);
        let result = stress::run(scenario, config);
        let record = RunRecord::new(scenario.name(), &config, &result);
        if let Err(err) = emitter.emit(&record) {
            eprintln!("stress: cannot write record: {err}");
            return ExitCode::FAILURE;
        }
        failed |= record.outcome == Outcome::Fail;
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
