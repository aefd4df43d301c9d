use ethers_core::types::Address;
use thiserror::Error;

use crate::types::VenueId;

/// Lookups against the chain state cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("venue {0} not found")]
    VenueNotFound(VenueId),

    #[error("account {0:?} not found")]
    AccountNotFound(Address),
}

/// Nonce reservation failures. `InvariantViolation` is fatal for the account.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("account {0:?} is not tracked")]
    UnknownAccount(Address),

    #[error("account {account:?} already holds {outstanding} in-flight reservations")]
    Busy { account: Address, outstanding: usize },

    #[error("account {0:?} is halted pending operator intervention")]
    Halted(Address),

    #[error("nonce invariant violated for {account:?}: {detail}")]
    InvariantViolation { account: Address, detail: String },
}

impl NonceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, NonceError::InvariantViolation { .. })
    }
}

/// Errors reported by the node collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transport-level failure; safe to retry.
    #[error("node connectivity failure: {0}")]
    Connectivity(String),

    #[error("venue {0} unknown to node")]
    UnknownVenue(VenueId),

    #[error("node rpc error: {0}")]
    Rpc(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Connectivity(_))
    }
}

/// Relay responses that are not an acceptance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Connectivity, rate limiting or relay-side 5xx. A rebuilt bundle may succeed.
    #[error("transient relay error: {0}")]
    Transient(String),

    /// The relay refused the bundle on its merits (e.g. already included elsewhere).
    #[error("relay rejected bundle: {0}")]
    Rejected(String),
}

impl RelayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("signer refused authorization: {0}")]
    Unauthorized(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Technical failures surfaced by the core. Expected outcomes (staleness,
/// denial, non-inclusion, ...) are never represented here.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("degraded: {0}")]
    Degraded(#[from] NodeError),

    #[error("record {0} missing from ledger")]
    MissingRecord(String),
}
