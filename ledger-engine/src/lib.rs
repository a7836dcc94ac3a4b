//! QuickPe Ledger Engine
//!
//! Wallet balances for peer-to-peer transfers and deposits, backed by an
//! append-only double-entry log.
//!
//! # Architecture
//!
//! - **Versioned accounts**: every balance change is a compare-and-commit on
//!   the account's version inside a RocksDB optimistic transaction
//! - **Append-only log**: each transfer writes one debit and one credit under
//!   a shared transfer id; balances can always be rebuilt by replay
//! - **Rolling limits**: per-account deposit and transfer ceilings, updated in
//!   the same transaction as the balance
//! - **Out-of-band reconciler**: background task that compares store and log
//!   and corrects drift with adjustment entries
//!
//! # Invariants
//!
//! - Money conservation: a transfer never creates or destroys money
//! - No negative balances
//! - Replay equivalence: replaying an account's entries yields its balance
//! - Append-only: entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounts;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod log;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use limits::LimitDecision;
pub use metrics::Metrics;
pub use reconciler::{ReconcileReport, ReconciliationSummary};
pub use storage::Storage;
pub use types::{
    minor_units_from_decimal, Account, AccountId, DepositResult, Direction, EntryKind,
    EntryStatus, LedgerEntry, LimitCounter, LimitKind, TransferResult,
};
