//! Typed error surface for DHT callers.
//!
//! Recoverable conditions inside the router (parse failures, missing
//! listeners, sends to unknown peers) never reach this type; they are routed
//! to the error stream and logged. This enum is what the caller-facing
//! operations return.

use thiserror::Error;

/// Errors returned by the public DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// A search failed to find anything.
    #[error("not found")]
    NotFound,

    /// An awaited reply did not arrive before its deadline.
    #[error("call timed out")]
    Timeout,

    /// A search found a near node, but not the one asked for.
    #[error("search incomplete: found a near but not exact match")]
    SearchIncomplete,

    /// The routing table had no usable peer for the relevant level.
    #[error("lookup failure: routing table is empty")]
    LookupFailure,

    /// The operation exists in the protocol but is not implemented here.
    #[error("not implemented")]
    NotImplemented,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A lower-level failure carried upward with a note about where it bit.
    #[error("{note}: {source}")]
    Wrapped {
        note: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DhtError {
    /// Wrap a lower-level error with a short note naming the operation that
    /// failed. The counterpart of bubbling `anyhow` context out of the swarm.
    pub fn wrap<E>(source: E, note: impl Into<String>) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DhtError::Wrapped {
            note: note.into(),
            source: source.into(),
        }
    }
}

impl From<anyhow::Error> for DhtError {
    fn from(err: anyhow::Error) -> Self {
        DhtError::Wrapped {
            note: "internal error".to_string(),
            source: err.into(),
        }
    }
}
