//! # mpi-tcp Demo Binary — Main Entry Point
//!
//! Bootstraps a single rank of an MPI-over-TCP job, runs one selected
//! collective against the world communicator, prints a human-readable
//! summary, and finalizes. Identity (`MPI_SIZE`/`MPI_RANK`/`MPI_PORT_BASE`)
//! comes from the environment, the way a real launcher would set it per
//! child process; this binary's own flags only choose which demo to run
//! and how verbosely to log it.
//!
//! ## Concurrency model
//!
//! The MPI core itself runs on blocking OS threads; `#[tokio::main]` here
//! exists to host the non-blocking file-log writer's background worker
//! and to keep the entry point consistent with the rest of this crate's
//! ambient stack, not because the demo does any async I/O of its own.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use mpi_tcp::cli::{Args, Demo};
use mpi_tcp::datatype::{Datatype, Operation};
use mpi_tcp::logging::ColorizedFormatter;
use mpi_tcp::Communicator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("mpi-tcp.log"));
            let file_appender = tracing_appender::rolling::daily(dir, filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking_writer)
                    .with_ansi(false)
                    .with_filter(log_level)
                    .boxed(),
            )
        }
        None => {
            guard = None;
            None
        }
    };

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    info!(demo = args.demo.name(), "starting mpi-tcp demo");

    let comm = mpi_tcp::initialize().context("failed to initialize MPI runtime")?;
    info!(rank = comm.rank(), size = comm.size(), "runtime initialized");

    let outcome = run_demo(&comm, args.demo);

    if let Err(e) = &outcome {
        error!(error = %e, "demo collective failed");
    }

    if let Some(path) = &args.dump_json {
        let report = serde_json::json!({
            "rank": comm.rank(),
            "size": comm.size(),
            "demo": args.demo.name(),
            "ok": outcome.is_ok(),
            "error": outcome.as_ref().err().map(|e| e.to_string()),
            "result": outcome.as_ref().ok().cloned(),
        });
        std::fs::write(path, serde_json::to_string_pretty(&report)?).with_context(|| format!("failed to write {}", path.display()))?;
    }

    mpi_tcp::finalize().context("failed to finalize MPI runtime")?;

    outcome.map_err(anyhow::Error::from)?;
    info!("demo completed successfully");
    Ok(())
}

/// Runs the selected demo and reports its observable result as JSON, so an
/// out-of-process test harness can assert on more than exit status.
fn run_demo(comm: &Communicator, demo: Demo) -> mpi_tcp::Result<serde_json::Value> {
    let rank = comm.rank();

    let result = match demo {
        Demo::Barrier => {
            comm.barrier()?;
            info!(rank, "barrier released");
            serde_json::json!(null)
        }
        Demo::Bcast => {
            let mut buf = if rank == 0 { 42i32.to_le_bytes() } else { 0i32.to_le_bytes() };
            comm.bcast(&mut buf, 1, Datatype::INT32, 0)?;
            let value = i32::from_le_bytes(buf);
            info!(rank, value, "bcast complete");
            serde_json::json!({ "value": value })
        }
        Demo::Reduce => {
            let send = (rank + 1).to_le_bytes();
            let mut recv = [0u8; 4];
            comm.reduce(&send, &mut recv, 1, Datatype::INT32, Operation::Sum, 0)?;
            let sum = i32::from_le_bytes(recv);
            if rank == 0 {
                info!(rank, sum, "reduce complete");
            }
            serde_json::json!({ "sum": sum })
        }
        Demo::Allreduce => {
            let send = (rank + 1).to_le_bytes();
            let mut recv = [0u8; 4];
            comm.allreduce(&send, &mut recv, 1, Datatype::INT32, Operation::Sum)?;
            let sum = i32::from_le_bytes(recv);
            info!(rank, sum, "allreduce complete");
            serde_json::json!({ "sum": sum })
        }
        Demo::Gather => {
            let send = rank.to_le_bytes();
            let mut recv = vec![0u8; comm.size() * 4];
            comm.gather(&send, &mut recv, 1, Datatype::INT32, 0)?;
            let values = decode_i32_vec(&recv);
            if rank == 0 {
                info!(rank, ?values, "gather complete");
            }
            serde_json::json!({ "values": values })
        }
        Demo::Scatter => {
            let send: Vec<u8> = (0..comm.size() as i32).flat_map(|r| r.to_le_bytes()).collect();
            let mut recv = [0u8; 4];
            comm.scatter(&send, &mut recv, 1, Datatype::INT32, 0)?;
            let value = i32::from_le_bytes(recv);
            info!(rank, value, "scatter complete");
            serde_json::json!({ "value": value })
        }
        Demo::Allgather => {
            let send = rank.to_le_bytes();
            let mut recv = vec![0u8; comm.size() * 4];
            comm.allgather(&send, &mut recv, 1, Datatype::INT32)?;
            let values = decode_i32_vec(&recv);
            info!(rank, ?values, "allgather complete");
            serde_json::json!({ "values": values })
        }
        Demo::Alltoall => {
            let send: Vec<u8> = (0..comm.size() as i32).flat_map(|_| rank.to_le_bytes()).collect();
            let mut recv = vec![0u8; comm.size() * 4];
            comm.alltoall(&send, &mut recv, 1, Datatype::INT32)?;
            let values = decode_i32_vec(&recv);
            info!(rank, ?values, "alltoall complete");
            serde_json::json!({ "values": values })
        }
        Demo::Scan => {
            let send = (rank + 1).to_le_bytes();
            let mut recv = [0u8; 4];
            comm.scan(&send, &mut recv, 1, Datatype::INT32, Operation::Sum)?;
            let partial_sum = i32::from_le_bytes(recv);
            info!(rank, partial_sum, "scan complete");
            serde_json::json!({ "partial_sum": partial_sum })
        }
        Demo::Sendrecv => {
            if comm.size() != 2 {
                return Err(mpi_tcp::MpiError::InvalidRank { rank: comm.size() as i32, size: 2 });
            }
            if rank == 0 {
                comm.send(&7_i32.to_le_bytes(), 1, Datatype::INT32, 1, 11)?;
                serde_json::json!(null)
            } else {
                let mut buf = [0u8; 4];
                let status = comm.recv(&mut buf, 1, Datatype::INT32, mpi_tcp::ANY_SOURCE, mpi_tcp::ANY_TAG)?;
                let value = i32::from_le_bytes(buf);
                info!(rank, value, source = status.source, tag = status.tag, "sendrecv complete");
                serde_json::json!({ "value": value, "source": status.source, "tag": status.tag })
            }
        }
    };

    Ok(result)
}

fn decode_i32_vec(bytes: &[u8]) -> Vec<i32> {
    bytes.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}
