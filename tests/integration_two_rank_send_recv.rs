//! Spawns two real `mpi-tcp-demo` processes over loopback TCP and checks
//! that a point-to-point send from rank 0 is observed by rank 1 with the
//! expected value, source, and tag when received with `ANY_SOURCE`/`ANY_TAG`.

use std::process::{Command, Stdio};

use serde_json::Value;
use tempfile::tempdir;

/// Picks a port base unlikely to collide with another test in the same
/// run. Each test picks its own range rather than sharing one constant.
fn port_base_for(tag: u16) -> u16 {
    20000 + tag * 10
}

fn spawn_rank(port_base: u16, size: usize, rank: usize, demo: &str, dump_json: &std::path::Path) -> std::process::Child {
    Command::new(env!("CARGO_BIN_EXE_mpi-tcp-demo"))
        .arg("--demo")
        .arg(demo)
        .arg("--dump-json")
        .arg(dump_json)
        .env("MPI_SIZE", size.to_string())
        .env("MPI_RANK", rank.to_string())
        .env("MPI_PORT_BASE", port_base.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn mpi-tcp-demo")
}

#[test]
fn two_rank_sendrecv_delivers_value_source_and_tag() {
    let dir = tempdir().unwrap();
    let port_base = port_base_for(1);

    let report0 = dir.path().join("rank0.json");
    let report1 = dir.path().join("rank1.json");

    let mut child0 = spawn_rank(port_base, 2, 0, "sendrecv", &report0);
    let mut child1 = spawn_rank(port_base, 2, 1, "sendrecv", &report1);

    let status0 = child0.wait().expect("rank 0 did not exit");
    let status1 = child1.wait().expect("rank 1 did not exit");
    assert!(status0.success(), "rank 0 exited with failure");
    assert!(status1.success(), "rank 1 exited with failure");

    let report: Value = serde_json::from_str(&std::fs::read_to_string(&report1).unwrap()).unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["result"]["value"], 7);
    assert_eq!(report["result"]["source"], 0);
    assert_eq!(report["result"]["tag"], 11);
}
