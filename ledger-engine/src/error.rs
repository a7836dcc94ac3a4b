//! Error types for the ledger engine

use crate::types::AccountId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount is zero, negative, or not a whole number of minor units
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed request (self-transfer, bad account id, bad page)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account already opened
    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    /// Debit would take the balance below zero
    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        /// Account being debited
        account: AccountId,
        /// Amount requested
        required: i64,
        /// Balance at the time of the check
        available: i64,
    },

    /// Rolling-window limit would be breached
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// State changed between load and commit
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Version conflicts persisted past the retry bound
    #[error("Operation still contended after {attempts} attempts, retry later")]
    Retryable {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Transfer id unknown or not a reversible transfer
    #[error("Transfer not found: {0}")]
    TransferNotFound(Uuid),

    /// Transfer already has a reversal recorded
    #[error("Transfer {original} already reversed by {reversal}")]
    AlreadyReversed {
        /// Original transfer
        original: Uuid,
        /// Reversal that compensated it
        reversal: Uuid,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (conflicting ledger keys, overflow, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, blocking task panicked, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether rerunning the whole operation from scratch may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict(_))
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InvalidRequest(_) => "invalid_request",
            Error::AccountNotFound(_) => "account_not_found",
            Error::AccountExists(_) => "account_exists",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::LimitExceeded(_) => "limit_exceeded",
            Error::VersionConflict(_) => "version_conflict",
            Error::Retryable { .. } => "retryable",
            Error::TransferNotFound(_) => "transfer_not_found",
            Error::AlreadyReversed { .. } => "already_reversed",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Concurrency(format!("Blocking task failed: {}", err))
    }
}
