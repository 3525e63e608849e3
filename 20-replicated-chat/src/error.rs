//! Typed errors for the wire codec, the snapshot store and the client.
//!
//! Everything above these layers (server bootstrap, the interactive
//! client loop, `main`) works with `anyhow::Result` and adds context as
//! errors bubble up.

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::protocol::Status;

/// Failure to decode or encode a frame on a client connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first byte of a request was not a known operation.
    #[error("unknown operation code {0}")]
    UnknownOpcode(u8),

    /// The frame was delimited correctly but its contents were invalid.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed mid-frame")]
    Truncated,

    /// No terminator arrived within the discard bound.
    #[error("frame exceeds {0} bytes without a terminator")]
    FrameTooLong(usize),

    /// A response carried more records than the 2-byte header can count.
    #[error("{0} records do not fit in a response header")]
    TooManyRecords(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed(reason.into())
    }

    /// Whether the connection can keep going after answering this error.
    ///
    /// Recoverable errors leave the stream positioned at the start of the
    /// next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownOpcode(_) | ProtocolError::Malformed(_)
        )
    }
}

/// Failure to read or write a persisted server snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot at {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot")]
    Encode(#[source] serde_json::Error),
}

/// Failure of one client request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered, but not with success.
    #[error("server answered {0:?}")]
    Rejected(Status),

    #[error("failed to connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to {0} closed")]
    Disconnected(SocketAddr),

    #[error("no chat server configured")]
    NoServers,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether the connection is gone and another server should be tried.
    pub fn is_connection_lost(&self) -> bool {
        !matches!(self, ClientError::Rejected(_))
    }
}
