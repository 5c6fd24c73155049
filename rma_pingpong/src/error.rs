//! Error types for the ping-pong benchmark.

use std::fmt;
use std::io;

/// A failure reported by the RMA transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// The transport call that failed.
    pub op: &'static str,
    /// Human-readable status from the transport.
    pub message: String,
}

impl TransportError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Benchmark errors. Every kind is fatal for the run.
#[derive(Debug)]
pub enum Error {
    /// RMA context, worker, endpoint or group-layer bring-up failed.
    Init(TransportError),
    /// Buffer allocation failed.
    NoMemory(usize),
    /// Memory registration or remote key unpack failed.
    Registration(TransportError),
    /// Address or key exchange through the group layer failed.
    Exchange(String),
    /// A non-blocking put or flush completed with an error.
    Operation(TransportError),
    /// An RMA operation was attempted before `reg_buffer` succeeded.
    NotRegistered,
    /// The pair protocol needs exactly two peers.
    PeerCount(usize),
    /// `bench` was entered with a non-zero receive slot.
    NotZeroed { size: usize },
    /// Invalid sweep or bench parameters.
    Config(String),
    /// Writing the report failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Init(e) => write!(f, "initialization failed: {}", e),
            Error::NoMemory(len) => write!(f, "failed to allocate {} bytes", len),
            Error::Registration(e) => write!(f, "memory registration failed: {}", e),
            Error::Exchange(msg) => write!(f, "exchange failed: {}", msg),
            Error::Operation(e) => write!(f, "RMA operation failed: {}", e),
            Error::NotRegistered => write!(f, "no registered region"),
            Error::PeerCount(n) => write!(f, "exactly 2 peers are required, got {}", n),
            Error::NotZeroed { size } => {
                write!(f, "receive buffer is not zeroed over the first {} bytes", size)
            }
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Init(e) | Error::Registration(e) | Error::Operation(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for benchmark operations.
pub type Result<T> = std::result::Result<T, Error>;
