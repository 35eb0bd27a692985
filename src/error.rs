//! Error taxonomy for the tether client
//!
//! Every failure is classified the same way the main loop reacts to it:
//!
//! - **Fatal at startup**: connection failure, missing required global, the first
//!   buffer cannot be allocated, a required CLI argument is missing
//! - **Fatal at runtime**: the dispatch call fails; the loop exits and tears down
//! - **Recoverable protocol**: an import token is rejected or revoked; the window
//!   keeps running unparented
//! - **Resource allocation during resize**: the previous buffer stays attached and
//!   the resize cycle is skipped

use crate::protocol::ObjectId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Shared-memory buffer allocation failures
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid buffer size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("shm_open failed: {0}")]
    Open(#[source] io::Error),

    #[error("could not find a free shm segment name after {attempts} attempts")]
    NameExhausted { attempts: usize },

    #[error("failed to size shm segment to {size} bytes: {source}")]
    Truncate {
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to map shm segment: {0}")]
    Map(#[source] io::Error),

    #[error("compositor rejected shm buffer: {0}")]
    Server(#[from] TransportError),
}

/// Failures talking to the display server
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to display: {0}")]
    Connect(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("flush failed: {0}")]
    Flush(String),

    #[error("failed to bind {interface} v{version}: {reason}")]
    Bind {
        interface: String,
        version: u32,
        reason: String,
    },

    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("object {object} is not a {expected}")]
    WrongInterface {
        object: ObjectId,
        expected: &'static str,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The event source has nothing left to deliver and never will
    #[error("event source drained")]
    Drained,
}

/// Failures before the main loop starts
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("missing required global {interface}")]
    MissingGlobal { interface: &'static str },

    #[error("{interface} advertised at v{advertised}, need at least v{required}")]
    GlobalTooOld {
        interface: &'static str,
        advertised: u32,
        required: u32,
    },

    #[error("failed to allocate the first buffer: {0}")]
    FirstBuffer(#[source] AllocError),

    #[error("no export handle given (pass it as an argument or via --handle-file)")]
    MissingHandle,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of the xdg-foreign export/import handshake
#[derive(Debug, Error)]
pub enum ForeignError {
    #[error("surface {0} has not been configured and committed yet")]
    NotConfigured(ObjectId),

    #[error("surface {0} was already committed; parent must be set before the first commit")]
    AlreadyCommitted(ObjectId),

    #[error("handle export already requested")]
    AlreadyExported,

    #[error("handle import already requested")]
    AlreadyImported,

    #[error("compositor does not support {0}")]
    Unsupported(&'static str),

    #[error("invalid export handle {0:?}")]
    InvalidHandle(String),

    #[error("failed to publish handle: {0}")]
    Publish(#[source] io::Error),

    #[error("failed to read handle file {}: {source}", path.display())]
    HandleFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of the cross-process size channels
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("size channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed size message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Top-level error for the client
#[derive(Debug, Error)]
pub enum TetherError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Foreign(#[from] ForeignError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl TetherError {
    /// Whether the process must stop on this error
    pub fn is_fatal(&self) -> bool {
        match self {
            TetherError::Startup(_) | TetherError::Transport(_) => true,
            TetherError::Foreign(ForeignError::Transport(_)) => true,
            TetherError::Foreign(_) => false,
            TetherError::Alloc(_) | TetherError::Sync(_) => false,
        }
    }
}
