//! # Error Types
//!
//! This module defines the typed error hierarchy used throughout the MPI
//! runtime. Validation errors are synchronous and raised before any I/O,
//! transport errors surface through blocking calls or through a request's
//! terminal state, and fatal lifecycle errors (double initialize,
//! finalize before initialize) never silently succeed.
//!
//! ## Design
//!
//! The library boundary uses `MpiError`, a `thiserror`-derived enum so
//! every variant carries a descriptive `Display` message and implements
//! `std::error::Error`. Application code (the demo binary, integration
//! tests) is free to convert into `anyhow::Error` via `?` at the edges,
//! keeping internal transport errors typed while the top-level binary
//! deals in `anyhow::Result`.

/// Top-level error type for all fallible MPI operations.
#[derive(Debug, thiserror::Error)]
pub enum MpiError {
    /// `initialize()` was called while a process manager already exists.
    #[error("MPI runtime is already initialized")]
    AlreadyInitialized,

    /// An operation requiring an initialized runtime was attempted before
    /// `initialize()` or after `finalize()`.
    #[error("MPI runtime is not initialized")]
    NotInitialized,

    /// `initialize()` failed to bring up the full mesh of peer transports.
    #[error("MPI initialization failed: {0}")]
    InitializationFailed(String),

    /// `finalize()` failed to cleanly release manager resources.
    #[error("MPI finalization failed: {0}")]
    FinalizationFailed(String),

    /// A communicator handle was used after being freed, or does not
    /// belong to the calling process's runtime.
    #[error("invalid communicator")]
    InvalidCommunicator,

    /// A rank argument was outside `[0, size)` (ANY_SOURCE excepted).
    #[error("invalid rank {rank} for communicator of size {size}")]
    InvalidRank { rank: i32, size: usize },

    /// A tag argument was negative and not the ANY_TAG sentinel, or fell
    /// inside a reserved collective tag range.
    #[error("invalid tag {0}")]
    InvalidTag(i32),

    /// A reduction operation does not apply to a given datatype.
    #[error("operation {op} is not defined for datatype {datatype}")]
    InvalidDatatype {
        op: &'static str,
        datatype: &'static str,
    },

    /// A communication-layer failure: truncation, timeout, or a transport
    /// that transitioned to *failed*.
    #[error("communication error: {0}")]
    Communication(#[from] CommunicationError),

    /// Peer discovery / full-mesh connection establishment failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Reserved for launchers built on top of this crate; the core never
    /// spawns processes itself.
    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// A catch-all for operation-specific failures that do not fit another
    /// variant, carrying free-form context.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// Sub-category of [`MpiError::Communication`].
#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    /// A posted receive's buffer capacity was smaller than the arriving
    /// frame's payload.
    #[error("truncation: buffer can hold at most {expected_max} bytes, received {actual}")]
    Truncation { expected_max: usize, actual: usize },

    /// A send or wait exceeded its deadline.
    #[error("timeout")]
    Timeout,

    /// The underlying TCP connection failed (I/O error, peer closed, or
    /// handshake mismatch).
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl From<std::io::Error> for MpiError {
    fn from(e: std::io::Error) -> Self {
        MpiError::Communication(CommunicationError::TransportFailure(e.to_string()))
    }
}

impl From<std::io::Error> for CommunicationError {
    fn from(e: std::io::Error) -> Self {
        CommunicationError::TransportFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MpiError>;

/// Helper for formatting a (op, datatype) pair in error messages without
/// allocating; used by the kernel table lookup in `datatype.rs`.
pub(crate) fn invalid_datatype(op: &'static str, datatype: &'static str) -> MpiError {
    MpiError::InvalidDatatype { op, datatype }
}
