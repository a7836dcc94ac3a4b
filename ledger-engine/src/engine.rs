//! Transfer engine
//!
//! Each `try_*` method is one attempt: load, decide, then stage every write
//! (account versions, ledger entries, limit counters) in a single storage
//! transaction and commit it. A conflict anywhere aborts the attempt with
//! nothing applied; the caller reruns it from the load step.
//!
//! Accounts touched by one attempt are always committed in ascending id
//! order, never in request order.

use crate::{
    accounts::AccountStore,
    limits::LimitGuard,
    log::LedgerLog,
    storage::{Storage, Txn, CF_REVERSALS},
    types::{
        validate_amount, Account, AccountId, DepositResult, Direction, EntryKind, EntryStatus,
        LedgerEntry, LimitKind, TransferResult,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Peer-to-peer transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Sender
    pub from: AccountId,
    /// Receiver
    pub to: AccountId,
    /// Amount in minor units
    pub amount: i64,
    /// Shown in both histories
    pub description: String,
}

impl TransferRequest {
    /// Reject requests that can never succeed, before any I/O
    pub fn validate(&self) -> Result<()> {
        validate_amount(self.amount)?;
        self.from.validate()?;
        self.to.validate()?;
        if self.from == self.to {
            return Err(Error::InvalidRequest(format!(
                "Cannot transfer from {} to itself",
                self.from
            )));
        }
        Ok(())
    }
}

/// Atomic balance mutations
#[derive(Debug, Clone)]
pub struct TransferEngine {
    storage: Arc<Storage>,
    accounts: AccountStore,
    log: LedgerLog,
    limits: LimitGuard,
}

impl TransferEngine {
    /// Wire the engine to its collaborators
    pub fn new(
        storage: Arc<Storage>,
        accounts: AccountStore,
        log: LedgerLog,
        limits: LimitGuard,
    ) -> Self {
        Self {
            storage,
            accounts,
            log,
            limits,
        }
    }

    /// One transfer attempt
    pub fn try_transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let now = Utc::now();

        let from = self.accounts.get(&request.from)?;
        let to = self.accounts.get(&request.to)?;

        if from.balance < request.amount {
            return Err(Error::InsufficientFunds {
                account: from.id.clone(),
                required: request.amount,
                available: from.balance,
            });
        }

        let new_from = from.balance - request.amount;
        let new_to = credit(&to, request.amount)?;

        let transfer_id = Uuid::now_v7();
        let txn = self.storage.transaction();

        let updated = self.commit_in_order(&txn, &[(&from, new_from), (&to, new_to)], now)?;
        let (updated_from, updated_to) = (&updated[0], &updated[1]);

        let entries = [
            LedgerEntry {
                description: request.description.clone(),
                counterparty: Some(to.id.clone()),
                ..new_entry(
                    transfer_id,
                    EntryKind::Transfer,
                    updated_from,
                    Direction::Debit,
                    request.amount,
                    now,
                )
            },
            LedgerEntry {
                description: request.description.clone(),
                counterparty: Some(from.id.clone()),
                ..new_entry(
                    transfer_id,
                    EntryKind::Transfer,
                    updated_to,
                    Direction::Credit,
                    request.amount,
                    now,
                )
            },
        ];
        self.append_fresh(&txn, &entries)?;

        self.limits
            .commit(&txn, &from.id, LimitKind::Transfer, request.amount, now)?;

        self.storage.commit(txn)?;

        tracing::info!(
            transfer_id = %transfer_id,
            from = %from.id,
            to = %to.id,
            amount = request.amount,
            "Transfer committed"
        );

        Ok(TransferResult {
            transfer_id,
            new_from_balance: updated_from.balance,
            new_to_balance: updated_to.balance,
        })
    }

    /// One deposit attempt
    pub fn try_deposit(
        &self,
        account_id: &AccountId,
        amount: i64,
        description: &str,
    ) -> Result<DepositResult> {
        let now = Utc::now();

        let account = self.accounts.get(account_id)?;
        let new_balance = credit(&account, amount)?;

        let transfer_id = Uuid::now_v7();
        let txn = self.storage.transaction();

        let updated = self
            .accounts
            .commit(&txn, account_id, new_balance, account.version, now)?;

        let entry = LedgerEntry {
            description: description.to_string(),
            ..new_entry(transfer_id, EntryKind::Deposit, &updated, Direction::Credit, amount, now)
        };
        self.append_fresh(&txn, &[entry])?;

        self.limits
            .commit(&txn, account_id, LimitKind::Deposit, amount, now)?;

        self.storage.commit(txn)?;

        tracing::info!(
            transfer_id = %transfer_id,
            account_id = %account_id,
            amount,
            "Deposit committed"
        );

        Ok(DepositResult {
            transfer_id,
            new_balance: updated.balance,
        })
    }

    /// One account-opening attempt
    ///
    /// A positive opening balance is recorded as an `Opening` credit so the
    /// log explains it. Limits do not apply.
    pub fn try_open_account(
        &self,
        account_id: &AccountId,
        opening_balance: i64,
    ) -> Result<Account> {
        if opening_balance < 0 {
            return Err(Error::InvalidAmount(format!(
                "Opening balance must not be negative, got {}",
                opening_balance
            )));
        }

        let now = Utc::now();
        let txn = self.storage.transaction();

        let mut account = self.accounts.create(&txn, account_id, now)?;

        if opening_balance > 0 {
            account = self
                .accounts
                .commit(&txn, account_id, opening_balance, account.version, now)?;
            let entry = LedgerEntry {
                description: "Opening balance".to_string(),
                ..new_entry(
                    Uuid::now_v7(),
                    EntryKind::Opening,
                    &account,
                    Direction::Credit,
                    opening_balance,
                    now,
                )
            };
            self.append_fresh(&txn, &[entry])?;
        }

        self.storage.commit(txn)?;

        tracing::info!(account_id = %account_id, opening_balance, "Account opened");

        Ok(account)
    }

    /// One reversal attempt
    ///
    /// Moves the amount back from the original receiver to the original
    /// sender under a new transfer id. Each transfer can be reversed once.
    pub fn try_reverse(&self, original: Uuid, reason: &str) -> Result<TransferResult> {
        let now = Utc::now();

        let entries = self.log.transfer_entries(original)?;
        let debit = entries
            .iter()
            .find(|e| e.kind == EntryKind::Transfer && e.direction == Direction::Debit);
        let credit_side = entries
            .iter()
            .find(|e| e.kind == EntryKind::Transfer && e.direction == Direction::Credit);
        let (debit, credit_side) = match (debit, credit_side) {
            (Some(d), Some(c)) => (d, c),
            _ => return Err(Error::TransferNotFound(original)),
        };
        let amount = debit.amount;

        let marker_key = original.as_bytes().to_vec();
        if let Some(existing) = self.storage.get_raw(CF_REVERSALS, &marker_key)? {
            return Err(Error::AlreadyReversed {
                original,
                reversal: Storage::entry_id_from_value(&existing)?,
            });
        }

        // Original receiver pays back the original sender
        let payer = self.accounts.get(&credit_side.account_id)?;
        let payee = self.accounts.get(&debit.account_id)?;

        if payer.balance < amount {
            return Err(Error::InsufficientFunds {
                account: payer.id.clone(),
                required: amount,
                available: payer.balance,
            });
        }

        let new_payer = payer.balance - amount;
        let new_payee = credit(&payee, amount)?;

        let reversal_id = Uuid::now_v7();
        let txn = self.storage.transaction();

        if let Some(existing) = self
            .storage
            .get_for_update_raw(&txn, CF_REVERSALS, &marker_key)?
        {
            return Err(Error::AlreadyReversed {
                original,
                reversal: Storage::entry_id_from_value(&existing)?,
            });
        }
        self.storage
            .put_raw(&txn, CF_REVERSALS, &marker_key, reversal_id.as_bytes())?;

        let updated = self.commit_in_order(&txn, &[(&payer, new_payer), (&payee, new_payee)], now)?;
        let (updated_payer, updated_payee) = (&updated[0], &updated[1]);

        let description = format!("Reversal: {}", reason);
        let reversal_entries = [
            LedgerEntry {
                description: description.clone(),
                status: EntryStatus::Reversed,
                counterparty: Some(payee.id.clone()),
                reverses: Some(original),
                ..new_entry(
                    reversal_id,
                    EntryKind::Reversal,
                    updated_payer,
                    Direction::Debit,
                    amount,
                    now,
                )
            },
            LedgerEntry {
                description,
                status: EntryStatus::Reversed,
                counterparty: Some(payer.id.clone()),
                reverses: Some(original),
                ..new_entry(
                    reversal_id,
                    EntryKind::Reversal,
                    updated_payee,
                    Direction::Credit,
                    amount,
                    now,
                )
            },
        ];
        self.append_fresh(&txn, &reversal_entries)?;

        self.storage.commit(txn)?;

        tracing::info!(
            transfer_id = %reversal_id,
            reverses = %original,
            amount,
            "Transfer reversed"
        );

        Ok(TransferResult {
            transfer_id: reversal_id,
            new_from_balance: updated_payer.balance,
            new_to_balance: updated_payee.balance,
        })
    }

    /// Commit balance changes in ascending account-id order
    ///
    /// Results come back in the order of `changes`.
    fn commit_in_order(
        &self,
        txn: &Txn<'_>,
        changes: &[(&Account, i64)],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        let mut order: Vec<usize> = (0..changes.len()).collect();
        order.sort_by(|&a, &b| changes[a].0.id.cmp(&changes[b].0.id));

        let mut updated: Vec<Option<Account>> = vec![None; changes.len()];
        for index in order {
            let (account, new_balance) = changes[index];
            updated[index] = Some(self.accounts.commit(
                txn,
                &account.id,
                new_balance,
                account.version,
                now,
            )?);
        }

        updated
            .into_iter()
            .map(|a| {
                a.ok_or_else(|| {
                    Error::InvariantViolation("Account change not committed".to_string())
                })
            })
            .collect()
    }

    /// Append entries that were just built under a fresh transfer id
    fn append_fresh(&self, txn: &Txn<'_>, entries: &[LedgerEntry]) -> Result<()> {
        let outcome = self.log.append_in(txn, entries)?;
        if outcome.already_present > 0 {
            return Err(Error::InvariantViolation(format!(
                "Fresh transfer {} collided with existing entries",
                entries[0].transfer_id
            )));
        }
        Ok(())
    }
}

/// Balance after crediting `amount`, guarding against overflow
fn credit(account: &Account, amount: i64) -> Result<i64> {
    account.balance.checked_add(amount).ok_or_else(|| {
        Error::InvalidAmount(format!(
            "Crediting {} to {} overflows the balance",
            amount, account.id
        ))
    })
}

/// Entry reflecting `account` right after it was committed
pub(crate) fn new_entry(
    transfer_id: Uuid,
    kind: EntryKind,
    account: &Account,
    direction: Direction,
    amount: i64,
    now: DateTime<Utc>,
) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::now_v7(),
        transfer_id,
        account_id: account.id.clone(),
        direction,
        amount,
        resulting_balance: account.balance,
        account_version: account.version,
        timestamp: now,
        description: String::new(),
        status: EntryStatus::Completed,
        kind,
        counterparty: None,
        reverses: None,
    }
}
