//! # Peer Transport
//!
//! One [`PeerTransport`] exists per ordered pair of ranks that can
//! exchange messages over the network (the local rank's connection to
//! every other rank). Each holds a single long-lived `TcpStream`, tuned
//! with `TCP_NODELAY` and explicit socket buffer sizes the way the
//! benchmark transports in this crate's lineage configure theirs, and a
//! dedicated receive-loop thread that blocks on `read()`, decodes frames
//! with [`FrameDecoder`], and hands each complete frame to the match
//! engine's `deliver`.
//!
//! Sends are synchronous and serialized behind a `Mutex<TcpStream>` clone
//! so concurrent `send`/`isend` calls from different caller threads never
//! interleave a frame's header with another frame's payload on the wire.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CommunicationError, MpiError, Result};
use crate::matching::MatchEngine;
use crate::wire::{Frame, FrameDecoder};

/// Socket buffer size applied to every peer connection. Matches the
/// default buffer size used elsewhere in this crate's transports.
const SOCKET_BUFFER_BYTES: usize = 256 * 1024;

/// A single peer connection: one TCP stream, used for both directions.
pub struct PeerTransport {
    peer_rank: i32,
    write_half: Mutex<TcpStream>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    failed: Arc<AtomicBool>,
}

impl PeerTransport {
    /// Wrap an already-connected stream, apply socket tuning, and spawn
    /// the receive loop that feeds `engine`. `local_rank` is only used to
    /// label the thread and log lines. `live_peers` is shared by every
    /// transport in this process's mesh, initialized to the peer count; it
    /// lets the receive loop tell whether it was the last live connection
    /// when deciding whether a wildcard receive can still be satisfied.
    pub fn spawn(local_rank: i32, peer_rank: i32, stream: TcpStream, engine: Arc<MatchEngine>, live_peers: Arc<AtomicUsize>) -> Result<Self> {
        tune_socket(&stream)?;

        let read_half = stream.try_clone().map_err(MpiError::from)?;
        let write_half = stream;
        let failed = Arc::new(AtomicBool::new(false));
        let thread_failed = Arc::clone(&failed);

        let handle = std::thread::Builder::new()
            .name(format!("mpi-recv-{local_rank}-{peer_rank}"))
            .spawn(move || receive_loop(local_rank, peer_rank, read_half, engine, thread_failed, live_peers))
            .map_err(|e| MpiError::InitializationFailed(format!("failed to spawn receive thread: {e}")))?;

        Ok(Self {
            peer_rank,
            write_half: Mutex::new(write_half),
            receive_thread: Mutex::new(Some(handle)),
            failed,
        })
    }

    /// Send one frame to this peer. Blocks until the full frame (header +
    /// payload) has been written to the socket.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(MpiError::Communication(CommunicationError::TransportFailure(format!(
                "connection to rank {} has failed",
                self.peer_rank
            ))));
        }

        let bytes = frame.to_bytes()?;
        let mut stream = self.write_half.lock();
        stream.write_all(&bytes).map_err(|e| {
            self.failed.store(true, Ordering::Release);
            MpiError::from(e)
        })?;
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Shut down the connection and join the receive thread. Used during
    /// `finalize()`; errors are logged, not propagated, since finalize
    /// must still make progress on every other peer.
    pub fn shutdown(&self) {
        if let Ok(stream) = self.write_half.lock().try_clone() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.receive_thread.lock().take() {
            if handle.join().is_err() {
                warn!(peer = self.peer_rank, "receive thread panicked during shutdown");
            }
        }
    }
}

fn tune_socket(stream: &TcpStream) -> Result<()> {
    // `Socket::from` takes ownership of a raw descriptor; hand it a
    // duplicate so dropping `socket` below closes only that duplicate and
    // leaves `stream`'s own descriptor untouched.
    let socket = socket2::Socket::from(stream.try_clone().map_err(MpiError::from)?);
    socket.set_nodelay(true).map_err(MpiError::from)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES).map_err(MpiError::from)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_BYTES).map_err(MpiError::from)?;
    Ok(())
}

fn receive_loop(
    local_rank: i32,
    peer_rank: i32,
    mut stream: TcpStream,
    engine: Arc<MatchEngine>,
    failed: Arc<AtomicBool>,
    live_peers: Arc<AtomicUsize>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                debug!(local_rank, peer_rank, "peer closed connection");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(local_rank, peer_rank, error = %e, "receive loop I/O error");
                break;
            }
        };

        match decoder.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    engine.deliver(frame);
                }
            }
            Err(e) => {
                warn!(local_rank, peer_rank, error = %e, "frame decode error, closing connection");
                break;
            }
        }
    }

    failed.store(true, Ordering::Release);
    let remaining = live_peers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
    engine.fail_peer(peer_rank, &format!("connection to rank {peer_rank} closed"), remaining == 0);
}
