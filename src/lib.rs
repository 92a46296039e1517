//! # MPI-over-TCP Runtime
//!
//! A Message Passing Interface runtime implemented entirely on top of
//! plain TCP sockets, with no reliance on an external MPI library.
//! Processes in a job are launched with environment-provided identity
//! (`MPI_SIZE`, `MPI_RANK`, `MPI_PORT_BASE`) and discover each other
//! through a derived per-rank listening port on loopback.
//!
//! Call [`initialize`] once at process start to obtain the world
//! communicator, exchange messages through the [`Communicator`]'s
//! point-to-point and collective methods, and call [`finalize`] before
//! exit.

pub mod collective;
pub mod communicator;
pub mod datatype;
pub mod error;
pub mod matching;
pub mod p2p;
pub mod process;
pub mod request;
pub mod transport;
pub mod wire;

pub mod cli;
pub mod logging;

pub use communicator::Communicator;
pub use datatype::{Datatype, Operation};
pub use error::{CommunicationError, MpiError, Result};
pub use matching::{ANY_SOURCE, ANY_TAG};
pub use request::{wait_all, wait_any, Request, Status};

use std::sync::{Arc, Mutex, OnceLock};

use process::ProcessManager;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values for the demo binary and for single-process
/// mode.
pub mod defaults {
    /// Port base used when `MPI_PORT_BASE` is unset.
    pub const PORT_BASE: u16 = crate::process::DEFAULT_PORT_BASE;

    /// Job size used when `MPI_SIZE` is unset.
    pub const SIZE: usize = 1;

    /// Rank used when `MPI_RANK` is unset.
    pub const RANK: i32 = 0;
}

fn singleton() -> &'static Mutex<Option<Arc<ProcessManager>>> {
    static SINGLETON: OnceLock<Mutex<Option<Arc<ProcessManager>>>> = OnceLock::new();
    SINGLETON.get_or_init(|| Mutex::new(None))
}

/// Bring up the MPI runtime: read identity from the environment,
/// establish the full mesh of peer connections, and return the world
/// communicator. Exactly one [`ProcessManager`] may exist between
/// `initialize()` and `finalize()`; calling this twice without an
/// intervening `finalize()` fails with [`MpiError::AlreadyInitialized`].
pub fn initialize() -> Result<Communicator> {
    let mut guard = singleton().lock().unwrap();
    if guard.is_some() {
        return Err(MpiError::AlreadyInitialized);
    }

    let manager = Arc::new(ProcessManager::initialize()?);
    *guard = Some(Arc::clone(&manager));
    Ok(Communicator::world(manager))
}

/// Drain pending state, close every transport, and release the process
/// manager. Idempotent only in the sense that a second call fails with
/// [`MpiError::NotInitialized`] rather than silently succeeding.
pub fn finalize() -> Result<()> {
    let manager = {
        let mut guard = singleton().lock().unwrap();
        guard.take().ok_or(MpiError::NotInitialized)?
    };
    manager.finalize()
}

/// Close every transport without draining pending state and terminate the
/// process with `code`.
pub fn abort(code: i32) -> ! {
    let manager = singleton().lock().unwrap().take();
    match manager {
        Some(manager) => manager.abort(code),
        None => std::process::exit(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-wide singleton means these cases can't run as separate
    // `#[test]` functions without risking cross-test interference under
    // the default parallel test runner; one function walks the whole
    // initialize/finalize lifecycle in sequence instead.
    #[test]
    fn initialize_finalize_lifecycle() {
        std::env::remove_var("MPI_SIZE");
        std::env::remove_var("MPI_RANK");
        std::env::remove_var("MPI_PORT_BASE");

        let err = finalize().unwrap_err();
        assert!(matches!(err, MpiError::NotInitialized));

        let comm = initialize().unwrap();
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.rank(), 0);

        let err = initialize().unwrap_err();
        assert!(matches!(err, MpiError::AlreadyInitialized));

        finalize().unwrap();

        let err = finalize().unwrap_err();
        assert!(matches!(err, MpiError::NotInitialized));
    }
}
