//! Error taxonomy for the core, per the error handling design: callbacks
//! propagate failure by returning non-zero / scheduling shutdown, while
//! configuration and invariant errors are surfaced as structured results.

use std::io;

use crate::socket::SocketId;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the core can report. `transient-io` (`WouldBlock`/`EAGAIN`)
/// is deliberately not a variant here: it is handled locally by callers as
/// plain `io::ErrorKind::WouldBlock` and never escapes as an `Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any OS error on a socket other than a transient would-block.
    #[error("socket {socket:?}: fatal i/o error: {source}")]
    FatalIo {
        socket: SocketId,
        #[source]
        source: io::Error,
    },

    /// Protocol detection failed or a framed request was malformed.
    #[error("socket {socket:?}: protocol rejected: {reason}")]
    ProtocolReject { socket: SocketId, reason: String },

    /// ACL deny, connect-frequency exceeded, max-sockets exceeded, or flood.
    #[error("socket {socket:?}: policy rejected: {reason}")]
    PolicyReject { socket: SocketId, reason: String },

    /// Buffer overflow on read or write.
    #[error("socket {socket:?}: resource exhausted: {reason}")]
    ResourceExhausted { socket: SocketId, reason: String },

    /// Bad/duplicate instance name, unknown server type, schema violation.
    #[error("configuration error at {path}: {reason}")]
    Configuration { path: String, reason: String },

    /// Registry/list structure inconsistency, double enqueue, id mismatch.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    pub fn fatal_io(socket: SocketId, source: io::Error) -> Self {
        Error::FatalIo { socket, source }
    }

    pub fn protocol_reject(socket: SocketId, reason: impl Into<String>) -> Self {
        Error::ProtocolReject {
            socket,
            reason: reason.into(),
        }
    }

    pub fn policy_reject(socket: SocketId, reason: impl Into<String>) -> Self {
        Error::PolicyReject {
            socket,
            reason: reason.into(),
        }
    }

    pub fn resource_exhausted(socket: SocketId, reason: impl Into<String>) -> Self {
        Error::ResourceExhausted {
            socket,
            reason: reason.into(),
        }
    }

    pub fn configuration(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Error::InternalInvariant(reason.into())
    }

    /// Whether this error means the owning socket must be scheduled for
    /// shutdown (everything except `Configuration`, which never touches
    /// the loop).
    pub fn schedules_shutdown(&self) -> bool {
        !matches!(self, Error::Configuration { .. })
    }
}
