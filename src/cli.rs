//! # Command-Line Interface Module
//!
//! Argument parsing for `mpi-tcp-demo`, the smoke-test binary that
//! bootstraps one rank and runs a single collective against the world
//! communicator. This binary is not part of the MPI surface itself; it
//! exists as an operator tool for exercising a deployed build, the way a
//! benchmark harness's own CLI would.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Which collective the demo binary exercises against the world
/// communicator.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum Demo {
    Barrier,
    Bcast,
    Reduce,
    Allreduce,
    Gather,
    Scatter,
    Allgather,
    Alltoall,
    Scan,
    /// Point-to-point only: rank 0 sends to rank 1, which receives with
    /// `ANY_SOURCE`/`ANY_TAG`. Requires exactly two ranks.
    Sendrecv,
}

/// mpi-tcp demo binary: bootstraps one rank via `initialize()`, runs a
/// selected collective, prints a summary, and calls `finalize()`.
///
/// Identity (`MPI_SIZE`, `MPI_RANK`, `MPI_PORT_BASE`) is read from the
/// environment, not from these flags; a real job sets those per process
/// before launch.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Which collective to run against the world communicator.
    #[arg(long, value_enum, default_value_t = Demo::Barrier)]
    pub demo: Demo,

    /// Increase logging verbosity. Repeatable: -v (info), -vv (debug),
    /// -vvv (trace). With no flag, only warnings and errors are shown.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write a rolling log file to this path in addition to stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Dump a JSON status report (rank, size, demo run, outcome) to this
    /// path after the demo completes.
    #[arg(long)]
    pub dump_json: Option<PathBuf>,
}

impl Demo {
    pub fn name(self) -> &'static str {
        match self {
            Demo::Barrier => "barrier",
            Demo::Bcast => "bcast",
            Demo::Reduce => "reduce",
            Demo::Allreduce => "allreduce",
            Demo::Gather => "gather",
            Demo::Scatter => "scatter",
            Demo::Allgather => "allgather",
            Demo::Alltoall => "alltoall",
            Demo::Scan => "scan",
            Demo::Sendrecv => "sendrecv",
        }
    }
}
