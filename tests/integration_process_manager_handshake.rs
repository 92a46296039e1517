//! Exercises `ProcessManager::initialize()`'s full-mesh connection
//! establishment across more than two real processes, and checks that a
//! misconfigured rank fails the handshake synchronously instead of
//! hanging.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::tempdir;

fn spawn(port_base: u16, size: usize, rank: i32, demo: &str, dump_json: &std::path::Path) -> std::process::Child {
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

/// `alltoall` is the only demo that requires every ordered pair of ranks
/// to exchange a message, so a successful run proves the full mesh (not
/// just a star through rank 0) was actually established.
#[test]
fn four_ranks_establish_a_full_mesh_before_running_alltoall() {
    const SIZE: usize = 4;
    let dir = tempdir().unwrap();
    let port_base = 22000;

    let reports: Vec<_> = (0..SIZE).map(|r| dir.path().join(format!("rank{r}.json"))).collect();
    let mut children: Vec<_> = (0..SIZE as i32).map(|rank| spawn(port_base, SIZE, rank, "alltoall", &reports[rank as usize])).collect();

    let deadline = Instant::now() + Duration::from_secs(30);
    for (rank, child) in children.iter_mut().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = wait_with_timeout(child, remaining).unwrap_or_else(|| panic!("rank {rank} did not exit within the deadline"));
        assert!(status.success(), "rank {rank} exited with failure establishing the mesh");
    }

    for report_path in &reports {
        let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
        assert_eq!(report["ok"], true);
    }
}

/// A rank index outside `0..MPI_SIZE` is a configuration error the
/// process must reject before ever touching the network.
#[test]
fn out_of_range_rank_fails_fast_without_hanging() {
    let dir = tempdir().unwrap();
    let report = dir.path().join("bad.json");
    let mut child = spawn(22100, 2, 5, "barrier", &report);

    let status = wait_with_timeout(&mut child, Duration::from_secs(5)).expect("process should exit quickly on bad config, not hang");
    assert!(!status.success());
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
