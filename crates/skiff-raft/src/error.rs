//! Error types for the consensus engine.
//!
//! Errors are grouped by the layer that produces them:
//! - `Protocol`: malformed framing, incompatible URIs, undecodable messages
//! - `Cluster`: no known leader, unreachable peer
//! - `Commit`: the consumer failed while applying a submission
//! - `Log`: storage I/O, fatal to the owning resource
//! - `IllegalState`: monotonicity or lifecycle violations
//!
//! Peer-level protocol errors (term mismatches, log conflicts) are folded
//! into the role logic and never surface here; a client-visible future only
//! ever fails with `Commit`, `Cluster`, `Timeout`, or `Closed`.

use thiserror::Error;

use crate::LogIndex;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incompatible URI or wire framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cluster-level failure.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The consumer failed while applying a committed entry. The submission
    /// is lost but replicated state is otherwise intact.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Log storage failure. Fatal to the resource context.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Attempt to decrease a commit/apply cursor, double-vote, or operate on
    /// a closed context.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A submission deadline expired. The entry, if already appended, is not
    /// rolled back.
    #[error("operation timed out")]
    Timeout,

    /// The resource context is closed.
    #[error("context closed")]
    Closed,
}

/// Cluster-level errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No leader is known for the current term.
    #[error("no known leader")]
    NoLeader,

    /// A peer could not be reached.
    #[error("member {uri} unreachable: {reason}")]
    Unreachable {
        /// The unreachable member.
        uri: String,
        /// The underlying failure.
        reason: String,
    },
}

/// Log storage errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state failed validation.
    #[error("log corrupted: {0}")]
    Corrupted(String),

    /// The requested range was compacted away.
    #[error("log compacted, first available index is {0}")]
    Compacted(LogIndex),

    /// The log is closed.
    #[error("log closed")]
    Closed,
}

impl Error {
    /// Error for an unreachable peer.
    pub fn unreachable(uri: impl Into<String>, reason: impl ToString) -> Self {
        Error::Cluster(ClusterError::Unreachable {
            uri: uri.into(),
            reason: reason.to_string(),
        })
    }

    /// Error for a missing leader.
    pub fn no_leader() -> Self {
        Error::Cluster(ClusterError::NoLeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::no_leader();
        assert_eq!(err.to_string(), "no known leader");

        let err = Error::unreachable("tcp://10.0.0.2:7000", "connection refused");
        assert!(err.to_string().contains("tcp://10.0.0.2:7000"));
        assert!(err.to_string().contains("connection refused"));

        let err = Error::Log(LogError::Compacted(42));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_log_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = LogError::from(io).into();
        assert!(matches!(err, Error::Log(LogError::Io(_))));
    }
}
