//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (i64 minor units, never floating point)
//! - Cheap cloning across blocking-task boundaries

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Longest account identifier accepted, in bytes
pub const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Account identifier (user id from the wallet's user collection)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get as raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Check the id can be used as a storage key prefix
    ///
    /// The NUL byte separates the id from the suffix in composite keys,
    /// so it may not appear inside the id itself.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidRequest("Account id is empty".to_string()));
        }
        if self.0.len() > MAX_ACCOUNT_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "Account id longer than {} bytes",
                MAX_ACCOUNT_ID_LEN
            )));
        }
        if self.0.as_bytes().contains(&0) {
            return Err(Error::InvalidRequest(
                "Account id contains a NUL byte".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Wallet account as held by the account store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Balance in minor units (paise), never negative
    pub balance: i64,

    /// Optimistic concurrency token, bumped on every mutation
    pub version: u64,

    /// Opened at
    pub created_at: DateTime<Utc>,

    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

/// Side of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Money leaves the account
    Debit = 1,
    /// Money enters the account
    Credit = 2,
}

impl Direction {
    /// Byte used in the uniqueness key
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Debit => write!(f, "debit"),
            Direction::Credit => write!(f, "credit"),
        }
    }
}

/// Entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryStatus {
    /// Regular applied entry
    Completed = 1,
    /// Compensating entry written by a reversal
    Reversed = 2,
}

/// What produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Signup balance granted when the account was opened
    Opening = 1,
    /// Money added from outside the wallet
    Deposit = 2,
    /// Peer-to-peer transfer
    Transfer = 3,
    /// Compensating pair for an earlier transfer
    Reversal = 4,
    /// Reconciler correction
    Adjustment = 5,
}

impl EntryKind {
    /// Whether a transfer id of this kind carries a debit/credit pair
    pub fn is_paired(self) -> bool {
        matches!(self, EntryKind::Transfer | EntryKind::Reversal)
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Groups the sides of one transfer
    pub transfer_id: Uuid,

    /// Account this entry applies to
    pub account_id: AccountId,

    /// Debit or credit
    pub direction: Direction,

    /// Positive amount in minor units
    pub amount: i64,

    /// Account balance right after this entry
    pub resulting_balance: i64,

    /// Account version this entry produced
    pub account_version: u64,

    /// Entry timestamp
    pub timestamp: DateTime<Utc>,

    /// Free-form description shown in history
    pub description: String,

    /// Completed or reversed
    pub status: EntryStatus,

    /// Origin of the entry
    pub kind: EntryKind,

    /// Other side of a transfer
    #[serde(default)]
    pub counterparty: Option<AccountId>,

    /// Transfer compensated by this entry
    #[serde(default)]
    pub reverses: Option<Uuid>,
}

impl LedgerEntry {
    /// Amount with sign applied (credits positive)
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }
}

/// Operation kind tracked by the limit guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LimitKind {
    /// Add-money operations
    Deposit = 1,
    /// Outgoing peer-to-peer transfers
    Transfer = 2,
}

impl LimitKind {
    /// Byte used in the counter key
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Deposit => write!(f, "deposit"),
            LimitKind::Transfer => write!(f, "transfer"),
        }
    }
}

/// Rolling-window usage counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCounter {
    /// Account the counter belongs to
    pub account_id: AccountId,

    /// Tracked operation kind
    pub kind: LimitKind,

    /// Start of the current window
    pub window_start: DateTime<Utc>,

    /// Amount used in the window
    pub amount_in_window: i64,

    /// Operations in the window
    pub count_in_window: u32,
}

impl LimitCounter {
    /// Fresh counter whose window starts now
    pub fn new(account_id: AccountId, kind: LimitKind, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            kind,
            window_start: now,
            amount_in_window: 0,
            count_in_window: 0,
        }
    }

    /// Zero the counter once the window has fully elapsed
    ///
    /// Returns true if a reset happened.
    pub fn reset_if_window_expired(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        if now.signed_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.amount_in_window = 0;
            self.count_in_window = 0;
            true
        } else {
            false
        }
    }
}

/// Outcome of a transfer or reversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Transfer id shared by both entries
    pub transfer_id: Uuid,
    /// Sender balance after the transfer
    pub new_from_balance: i64,
    /// Receiver balance after the transfer
    pub new_to_balance: i64,
}

/// Outcome of a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositResult {
    /// Transfer id of the single credit entry
    pub transfer_id: Uuid,
    /// Balance after the deposit
    pub new_balance: i64,
}

/// Reject amounts that are not strictly positive
pub fn validate_amount(amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(Error::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    Ok(amount)
}

/// Convert a major-unit decimal (e.g. rupees) into minor units
///
/// `12.34` with two minor digits becomes `1234`. Fails if the value carries
/// precision below one minor unit or does not fit in an i64.
pub fn minor_units_from_decimal(amount: Decimal, minor_digits: u32) -> Result<i64> {
    let factor = 10i64
        .checked_pow(minor_digits)
        .map(Decimal::from)
        .ok_or_else(|| {
            Error::InvalidAmount(format!("{} minor digits is out of range", minor_digits))
        })?;
    let scaled = amount
        .checked_mul(factor)
        .ok_or_else(|| Error::InvalidAmount(format!("Amount {} overflows", amount)))?;

    if !scaled.fract().is_zero() {
        return Err(Error::InvalidAmount(format!(
            "Amount {} has more than {} decimal places",
            amount, minor_digits
        )));
    }

    let minor = scaled
        .trunc()
        .to_i64()
        .ok_or_else(|| Error::InvalidAmount(format!("Amount {} overflows", amount)))?;

    validate_amount(minor)
}
