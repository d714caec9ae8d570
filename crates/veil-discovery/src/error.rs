//! Discovery error types.

use thiserror::Error;

/// Errors returned by a discovery service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// No entry exists for the requested key
    #[error("entry not found")]
    EntryNotFound,

    /// Creating an entry that already exists
    #[error("entry already exists")]
    EntryAlreadyExists,

    /// Entry signature does not verify against its static key
    #[error("entry has invalid signature")]
    InvalidSignature,

    /// Update does not advance the sequence number by exactly one
    #[error("entry sequence must be {expected}, got {actual}")]
    InvalidSequence {
        /// Sequence the service expected
        expected: u64,
        /// Sequence carried by the update
        actual: u64,
    },

    /// Entry fails structural validation
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    /// Entry could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The service could not be reached
    #[error("discovery unavailable: {0}")]
    Unavailable(String),

    /// The request timed out
    #[error("discovery request timed out")]
    Timeout,
}

impl DiscoveryError {
    /// Returns true if the request may succeed when retried unchanged
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
