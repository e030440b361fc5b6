//! Unified error types for the Greybus engine.
//!
//! A single `Error` enum that every subsystem funnels into. All variants are
//! `Copy` so they can be returned from the receive path (which may run in
//! interrupt context) without allocation.

use core::fmt;

use crate::greybus::header::OpResult;

// ---------------------------------------------------------------------------
// Engine error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A buffer, Operation, FIFO slot or pending-list slot could not be
    /// allocated.
    OutOfMemory,
    /// Malformed frame, out-of-range cport or bad registration parameters.
    InvalidArgument,
    /// A driver is already registered on the cport.
    AlreadyExists,
    /// A request was reaped before its response arrived.
    Timeout,
    /// The Operation has already been responded to.
    InvalidState,
    /// The cport worker thread could not be created.
    WorkerSpawn,
    /// The peer answered with a non-success result.
    Remote(OpResult),
    /// Failure reported by the transport backend, passed through unchanged.
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::AlreadyExists => write!(f, "cport already has a driver"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::InvalidState => write!(f, "operation already responded"),
            Self::WorkerSpawn => write!(f, "cport worker spawn failed"),
            Self::Remote(r) => write!(f, "remote: {r}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Failures a [`TransportBackend`](crate::greybus::transport::TransportBackend)
/// may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The switch / link behind the cport is not present.
    NoDevice,
    /// The link is temporarily unable to accept the frame.
    Busy,
    /// Any other backend failure.
    Io(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no device"),
            Self::Busy => write!(f, "busy"),
            Self::Io(msg) => write!(f, "I/O: {msg}"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Error -> wire result mapping
// ---------------------------------------------------------------------------

impl From<Error> for OpResult {
    fn from(e: Error) -> Self {
        match e {
            Error::OutOfMemory => Self::NoMemory,
            Error::InvalidArgument => Self::Invalid,
            Error::Timeout => Self::Timeout,
            Error::InvalidState => Self::ProtocolBad,
            Error::AlreadyExists | Error::Transport(TransportError::Busy) => Self::Retry,
            Error::Transport(TransportError::NoDevice) => Self::Nonexistent,
            Error::Remote(r) => r,
            Error::WorkerSpawn | Error::Transport(TransportError::Io(_)) => Self::UnknownError,
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
