//! Error types for simulated network operations.
//!
//! Every public call returns a [`SimNetResult`]. The variants follow the
//! conventional stream-socket taxonomy so callers can decide what is terminal
//! and what may heal:
//!
//! | Variant | Terminal? | Typical cause |
//! |---------|-----------|---------------|
//! | [`SimNetError::Shutdown`] | yes | simulation or node torn down |
//! | [`SimNetError::Timeout`] | no | read/write deadline fired |
//! | [`SimNetError::Eof`] | this direction | peer closed its side |
//! | [`SimNetError::ClosedConnection`] | yes | use after local `close()` |
//! | [`SimNetError::Partitioned`] | no | target unreachable, may heal on UNPARTITION |

use std::io;
use thiserror::Error;

/// Errors that can occur while using the simulated network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimNetError {
    /// The simulation, or the node the operation belongs to, has been shut down.
    #[error("shutting down")]
    Shutdown,

    /// A read or write deadline fired before the operation completed.
    #[error("i/o timeout")]
    Timeout,

    /// The peer closed its side of the connection.
    #[error("EOF")]
    Eof,

    /// The operation was attempted on a connection already closed locally.
    #[error("use of closed network connection")]
    ClosedConnection,

    /// The target address is unreachable because of a partition.
    #[error("network partition: {0} is unreachable")]
    Partitioned(String),

    /// A message exceeded the dispatcher's maximum message size.
    #[error("message too long: {len} bytes exceeds the {max} byte limit; encrypted client vs an un-encrypted server?")]
    MessageTooLong {
        /// Length of the rejected message.
        len: usize,
        /// Configured maximum message size.
        max: usize,
    },

    /// Nothing is listening at the dialed address.
    #[error("connection refused: no server listening at {0}")]
    Refused(String),

    /// The address is already bound by a live listener or node.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// No node has ever been registered at this address.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// A node-anchored call was made before the node was registered
    /// (a timer requested before `listen()` or `dial()`).
    #[error("node is not registered with the simulation yet")]
    NotRegistered,

    /// The timer being waited on was discarded before it fired.
    #[error("timer discarded")]
    Discarded,

    /// The simulation configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SimNetError {
    /// True when the error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SimNetError::Timeout)
    }

    /// True when the condition is temporary. Only deadline expiries are.
    pub fn is_temporary(&self) -> bool {
        self.is_timeout()
    }

    /// True when retrying the same operation later may succeed.
    ///
    /// Partitions can heal, deadlines can be re-armed; everything else is
    /// terminal for the connection or the node.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SimNetError::Timeout | SimNetError::Partitioned(_))
    }

    /// True when the simulation or the node is gone.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SimNetError::Shutdown)
    }
}

/// A type alias for `Result<T, SimNetError>`.
pub type SimNetResult<T> = Result<T, SimNetError>;

impl From<SimNetError> for io::Error {
    fn from(err: SimNetError) -> Self {
        let kind = match &err {
            SimNetError::Shutdown => io::ErrorKind::BrokenPipe,
            SimNetError::Timeout => io::ErrorKind::TimedOut,
            SimNetError::Eof => io::ErrorKind::UnexpectedEof,
            SimNetError::ClosedConnection => io::ErrorKind::NotConnected,
            SimNetError::Partitioned(_) => io::ErrorKind::HostUnreachable,
            SimNetError::Refused(_) => io::ErrorKind::ConnectionRefused,
            SimNetError::AddressInUse(_) => io::ErrorKind::AddrInUse,
            SimNetError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            SimNetError::MessageTooLong { .. }
            | SimNetError::UnknownHost(_)
            | SimNetError::NotRegistered
            | SimNetError::Discarded => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
