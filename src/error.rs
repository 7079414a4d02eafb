//! toyraft errors. All errors are owned values without generic lifetimes, and
//! serializable, since command results are returned to submitting clients
//! across the network.

use serde_derive::{Deserialize, Serialize};

use crate::raft::NodeID;

/// A toyraft error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because the
    /// node lost leadership with the command still in flight, or because the
    /// node is shutting down.
    Abort,
    /// Invalid data, e.g. corruption of the metadata file or the peer
    /// protocol. Fatal when raised by the durable store during restore.
    InvalidData(String),
    /// An invalid client request, e.g. an oversized command.
    InvalidInput(String),
    /// An IO error. Fatal when raised by the durable store.
    IO(String),
    /// The node is not the leader. Commands must be submitted to the leader,
    /// given here if known.
    NotLeader { leader: Option<NodeID> },
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader { leader: Some(leader) } => {
                write!(f, "not the leader, try node {leader}")
            }
            Error::NotLeader { leader: None } => write!(f, "not the leader, no leader known"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A toyraft Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

// Channel errors happen when the remote end has hung up, typically during
// shutdown or a role change, so callers should retry.
impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Abort
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Abort
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(_: crossbeam::channel::RecvTimeoutError) -> Self {
        Error::Abort
    }
}
