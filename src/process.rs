//! # Process Manager
//!
//! Bootstraps one rank's identity from the environment, establishes the
//! full mesh of peer connections, and owns every resource scoped to the
//! `initialize()`/`finalize()` bracket: the listener, the per-peer
//! transports, and the match engine.
//!
//! Connection establishment avoids redundant sockets for the same
//! unordered pair: rank `r` dials every peer `p > r` and accepts
//! connections from every peer `p < r`. A tiny handshake (the dialer's
//! own rank, as a 4-byte little-endian `i32`) lets the acceptor file the
//! new socket under the right peer without the dialer announcing itself
//! out of band. Since each `PeerTransport` carries one bidirectional
//! stream, this single connection per unordered pair already satisfies
//! both directed legs (i→j and j→i).
//!
//! Both sides of the mesh are bounded by the same `INIT_TIMEOUT` deadline:
//! `dial_peer` backs off and retries until it expires, and `accept_peers`
//! polls the listener non-blocking against the same deadline, so the
//! highest-ranked rank (which only ever accepts, never dials) fails
//! `initialize()` instead of hanging forever when a peer never shows up.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{MpiError, Result};
use crate::matching::MatchEngine;
use crate::transport::PeerTransport;

/// Default base port used when `MPI_PORT_BASE` is absent (single-process
/// mode, where no peer connections are needed).
pub const DEFAULT_PORT_BASE: u16 = 49152;

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_RETRY_INITIAL: Duration = Duration::from_millis(50);
const DIAL_RETRY_MAX: Duration = Duration::from_millis(800);

/// Identity and addressing read from the environment at `initialize()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvConfig {
    pub size: usize,
    pub rank: i32,
    pub port_base: u16,
}

impl EnvConfig {
    /// Read `MPI_SIZE`, `MPI_RANK`, `MPI_PORT_BASE`, applying documented
    /// defaults (size=1, rank=0, port_base=49152) when a variable is
    /// unset. A variable that is set but fails to parse, or a rank
    /// outside `[0, size)`, is an initialization failure rather than a
    /// silent fallback to the default.
    pub fn from_env() -> Result<Self> {
        let size = parse_env_or("MPI_SIZE", 1usize)?;
        let rank = parse_env_or("MPI_RANK", 0i32)?;
        let port_base = parse_env_or("MPI_PORT_BASE", DEFAULT_PORT_BASE)?;

        if size == 0 {
            return Err(MpiError::InitializationFailed("MPI_SIZE must be at least 1".to_string()));
        }
        if rank < 0 || rank as usize >= size {
            return Err(MpiError::InitializationFailed(format!(
                "MPI_RANK {rank} out of range for MPI_SIZE {size}"
            )));
        }

        Ok(Self { size, rank, port_base })
    }
}

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| MpiError::InitializationFailed(format!("{var}={value:?} is not a valid value"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(MpiError::InitializationFailed(format!("{var} is not valid unicode")))
        }
    }
}

enum ManagerState {
    Ready,
    Failed,
}

/// Process-wide singleton owning the listener, peer table, match engine,
/// and tag-space allocator for the life of one initialize/finalize
/// bracket.
pub struct ProcessManager {
    pub config: EnvConfig,
    pub engine: Arc<MatchEngine>,
    peers: HashMap<i32, Arc<PeerTransport>>,
    state: Mutex<ManagerState>,
    next_tag_offset: AtomicU32,
    listener: Option<TcpListener>,
}

impl ProcessManager {
    /// Run the full bootstrap sequence: read identity, bind the listener,
    /// dial/accept the full mesh, and return a ready manager.
    pub fn initialize() -> Result<Self> {
        let config = EnvConfig::from_env()?;
        info!(rank = config.rank, size = config.size, "initializing MPI runtime");

        let engine = Arc::new(MatchEngine::new());

        if config.size == 1 {
            info!("single-process mode, no peer connections required");
            return Ok(Self {
                config,
                engine,
                peers: HashMap::new(),
                state: Mutex::new(ManagerState::Ready),
                next_tag_offset: AtomicU32::new(0),
                listener: None,
            });
        }

        let local_addr = format!("127.0.0.1:{}", config.port_base as u32 + config.rank as u32);
        let listener = TcpListener::bind(&local_addr)
            .map_err(|e| MpiError::InitializationFailed(format!("failed to bind {local_addr}: {e}")))?;
        info!(rank = config.rank, addr = %local_addr, "listening for peers");

        let peers = establish_full_mesh(&config, &listener)?;

        let live_peers = Arc::new(AtomicUsize::new(peers.len()));
        let mut transports = HashMap::with_capacity(peers.len());
        for (peer_rank, stream) in peers {
            let transport = PeerTransport::spawn(config.rank, peer_rank, stream, Arc::clone(&engine), Arc::clone(&live_peers))?;
            transports.insert(peer_rank, Arc::new(transport));
        }

        info!(rank = config.rank, peers = transports.len(), "full mesh ready");

        Ok(Self {
            config,
            engine,
            peers: transports,
            state: Mutex::new(ManagerState::Ready),
            next_tag_offset: AtomicU32::new(0),
            listener: Some(listener),
        })
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn rank(&self) -> i32 {
        self.config.rank
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ManagerState::Failed)
    }

    pub fn peer(&self, rank: i32) -> Result<Arc<PeerTransport>> {
        self.peers
            .get(&rank)
            .cloned()
            .ok_or_else(|| MpiError::InvalidRank { rank, size: self.config.size })
    }

    /// Allocate a fresh tag-space offset for a duplicated communicator.
    pub fn allocate_tag_offset(&self) -> u32 {
        self.next_tag_offset.fetch_add(RESERVED_TAG_SPAN, Ordering::Relaxed)
    }

    /// Drain pending state, close every transport and the listener, and
    /// mark the manager unavailable. Safe to call on every exit path;
    /// already-failed transports are skipped without erroring.
    pub fn finalize(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ManagerState::Failed) {
                return Err(MpiError::NotInitialized);
            }
            *state = ManagerState::Failed;
        }

        self.engine.fail_all_pending("finalize");

        for (rank, transport) in &self.peers {
            debug!(peer = rank, "closing peer transport");
            transport.shutdown();
        }

        // The listener itself closes when the last `Arc<ProcessManager>`
        // drops; nothing in `finalize` needs it once the mesh is torn down.

        info!(rank = self.config.rank, "MPI runtime finalized");
        Ok(())
    }

    /// Close every transport without draining pending state and exit the
    /// process immediately with `code`.
    pub fn abort(&self, code: i32) -> ! {
        error!(rank = self.config.rank, code, "aborting MPI runtime");
        for transport in self.peers.values() {
            transport.shutdown();
        }
        std::process::exit(code);
    }
}

/// Size of the tag range handed to each communicator duplication, large
/// enough to cover every reserved collective tag with headroom.
pub const RESERVED_TAG_SPAN: u32 = 20_000;

fn establish_full_mesh(config: &EnvConfig, listener: &TcpListener) -> Result<HashMap<i32, TcpStream>> {
    let connections: Arc<Mutex<HashMap<i32, TcpStream>>> = Arc::new(Mutex::new(HashMap::new()));
    let deadline = Instant::now() + INIT_TIMEOUT;

    let acceptor_connections = Arc::clone(&connections);
    let acceptor_listener = listener.try_clone().map_err(MpiError::from)?;
    let acceptor_local_rank = config.rank;
    let acceptor_expected: Vec<i32> = (0..config.size as i32).filter(|p| *p < config.rank).collect();
    let acceptor = std::thread::Builder::new()
        .name(format!("mpi-accept-{acceptor_local_rank}"))
        .spawn(move || accept_peers(acceptor_listener, acceptor_expected, acceptor_connections, deadline))
        .map_err(|e| MpiError::InitializationFailed(format!("failed to spawn acceptor thread: {e}")))?;

    for peer_rank in (config.rank + 1)..config.size as i32 {
        let stream = dial_peer(config.port_base, peer_rank, config.rank, deadline)?;
        connections.lock().unwrap().entry(peer_rank).or_insert(stream);
    }

    acceptor.join().map_err(|_| MpiError::InitializationFailed("acceptor thread panicked".to_string()))??;

    let result = Arc::try_unwrap(connections)
        .map_err(|_| MpiError::InitializationFailed("peer connection map still shared after mesh setup".to_string()))?
        .into_inner()
        .unwrap();

    let expected = config.size - 1;
    if result.len() != expected {
        return Err(MpiError::Connection(format!(
            "full mesh incomplete: expected {expected} peers, established {}",
            result.len()
        )));
    }

    Ok(result)
}

fn dial_peer(port_base: u16, peer_rank: i32, local_rank: i32, deadline: Instant) -> Result<TcpStream> {
    let addr = format!("127.0.0.1:{}", port_base as u32 + peer_rank as u32);
    let mut backoff = DIAL_RETRY_INITIAL;

    loop {
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                stream.write_all(&local_rank.to_le_bytes()).map_err(MpiError::from)?;
                debug!(local_rank, peer_rank, "dialed peer");
                return Ok(stream);
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(MpiError::Connection(format!("failed to connect to rank {peer_rank} at {addr}: {e}")));
            }
            Err(_) => {
                warn!(local_rank, peer_rank, "connect attempt failed, retrying");
                std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                backoff = (backoff * 2).min(DIAL_RETRY_MAX);
            }
        }
    }
}

/// Accept connections from every rank in `expected`, bounded by
/// `deadline` the same way `dial_peer` bounds its connect retries: the
/// listener is polled non-blocking so a partner that never dials in fails
/// this rank's `initialize()` instead of hanging it forever.
fn accept_peers(listener: TcpListener, expected: Vec<i32>, connections: Arc<Mutex<HashMap<i32, TcpStream>>>, deadline: Instant) -> Result<()> {
    if expected.is_empty() {
        return Ok(());
    }

    listener.set_nonblocking(true).map_err(MpiError::from)?;

    let mut remaining: std::collections::HashSet<i32> = expected.into_iter().collect();
    while !remaining.is_empty() {
        if Instant::now() >= deadline {
            return Err(MpiError::Connection(format!(
                "timed out waiting for peer(s) to connect: {remaining:?}"
            )));
        }

        let (mut stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20).min(deadline.saturating_duration_since(Instant::now())));
                continue;
            }
            Err(e) => return Err(MpiError::from(e)),
        };

        stream.set_nonblocking(false).map_err(MpiError::from)?;
        stream
            .set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1))))
            .map_err(MpiError::from)?;

        let mut rank_bytes = [0u8; 4];
        stream.read_exact(&mut rank_bytes).map_err(MpiError::from)?;
        let peer_rank = i32::from_le_bytes(rank_bytes);

        if !remaining.remove(&peer_rank) {
            warn!(peer_rank, "received duplicate or unexpected handshake, ignoring");
            continue;
        }

        stream.set_read_timeout(None).map_err(MpiError::from)?;
        debug!(peer_rank, "accepted peer");
        connections.lock().unwrap().insert(peer_rank, stream);
    }

    Ok(())
}
