//! Error types for beacon client operations

use thiserror::Error;

/// Result type for beacon client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Beacon client error types
#[derive(Debug, Error)]
pub enum Error {
    /// No root of trust was supplied to the builder
    #[error("no root of trust specified")]
    NoRootOfTrust,

    /// No transport backends or watcher were supplied to the builder
    #[error("no points of contact specified")]
    NoBackends,

    /// A supplied chain hash disagrees with the chain info it should identify
    #[error("invalid chain hash: expected {expected}, got {actual}")]
    ChainHashMismatch {
        /// Hash the caller pinned as the root of trust
        expected: String,
        /// Hash computed over the chain info a relay advertised
        actual: String,
    },

    /// Transport-level failure (connection, timeout, stream reset)
    #[error("network error: {0}")]
    Network(String),

    /// HTTP relay answered with a non-200 status
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// Wire payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Beacon failed signature or randomness verification
    #[error("invalid beacon: {0}")]
    InvalidBeacon(String),

    /// Relay returned a different round than the one requested
    #[error("round mismatch (malicious relay): requested {requested}, got {returned}")]
    RoundMismatch {
        /// Round the caller asked for
        requested: u64,
        /// Round the relay answered with
        returned: u64,
    },

    /// Beacon claims a round that has not happened yet
    #[error("beacon round {round} is in the future")]
    FutureBeacon {
        /// The claimed round
        round: u64,
    },

    /// Two distinct payloads were observed for the same round
    #[error("equivocation detected for round {round}")]
    Equivocation {
        /// The contested round
        round: u64,
    },

    /// Operation not supported by this client
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Operation attempted after the client was closed
    #[error("client closed")]
    Closed,

    /// Every backend failed; carries the accumulated causes
    #[error("no backend succeeded: {0}")]
    NotAvailable(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the optimizer may retry this failure on another backend.
    ///
    /// Verification and protocol failures short-circuit so a malicious
    /// relay is not masked by a slower honest one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::HttpStatus(_)
                | Error::Decode(_)
                | Error::Unsupported(_)
                | Error::NotAvailable(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Network(format!("grpc {}: {}", status.code(), status.message()))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}
