//! Append-only ledger log
//!
//! Entries are written once and never touched again. Each entry is stored
//! under its id and indexed twice:
//!
//! - `transfer_keys`: `(transfer_id, direction, account_id)`, the uniqueness
//!   constraint that makes appends idempotent
//! - `account_entries`: `(account_id, account_version)`, which orders an
//!   account's entries by commit order for replay and history

use crate::{
    storage::{Storage, Txn, CF_ACCOUNT_ENTRIES, CF_ENTRIES, CF_TRANSFER_KEYS},
    types::{AccountId, Direction, LedgerEntry},
    Error, Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// Result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    /// Entries newly written
    pub appended: usize,
    /// Entries skipped because the uniqueness key already held them
    pub already_present: usize,
}

/// Log replayed for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    /// Credits minus debits
    pub balance: i64,
    /// Number of entries folded
    pub entry_count: u64,
    /// Highest account version seen
    pub last_version: u64,
}

/// Ledger log over shared storage
#[derive(Debug, Clone)]
pub struct LedgerLog {
    storage: Arc<Storage>,
}

impl LedgerLog {
    /// Create log over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append a batch atomically in its own transaction
    pub fn append(&self, entries: &[LedgerEntry]) -> Result<AppendOutcome> {
        let txn = self.storage.transaction();
        let outcome = self.append_in(&txn, entries)?;
        self.storage.commit(txn)?;

        tracing::debug!(
            appended = outcome.appended,
            already_present = outcome.already_present,
            "Ledger batch appended"
        );

        Ok(outcome)
    }

    /// Stage a batch inside the caller's transaction
    ///
    /// All entries must share one transfer id. An entry whose uniqueness key
    /// already holds an equivalent entry is skipped; a key holding a
    /// different entry is an invariant violation and aborts the batch.
    pub fn append_in(&self, txn: &Txn<'_>, entries: &[LedgerEntry]) -> Result<AppendOutcome> {
        let first = entries
            .first()
            .ok_or_else(|| Error::InvariantViolation("Cannot append empty batch".to_string()))?;

        let mut outcome = AppendOutcome::default();

        for entry in entries {
            if entry.transfer_id != first.transfer_id {
                return Err(Error::InvariantViolation(format!(
                    "Batch mixes transfers {} and {}",
                    first.transfer_id, entry.transfer_id
                )));
            }
            if entry.amount <= 0 {
                return Err(Error::InvariantViolation(format!(
                    "Entry {} has non-positive amount {}",
                    entry.id, entry.amount
                )));
            }

            let unique_key =
                Storage::key_transfer(&entry.transfer_id, entry.direction, &entry.account_id);

            if let Some(existing_id) =
                self.storage
                    .get_for_update_raw(txn, CF_TRANSFER_KEYS, &unique_key)?
            {
                let existing = self.get_entry(Storage::entry_id_from_value(&existing_id)?)?;
                if existing.amount != entry.amount || existing.kind != entry.kind {
                    return Err(Error::InvariantViolation(format!(
                        "Transfer {} already has a different {} entry for {}",
                        entry.transfer_id, entry.direction, entry.account_id
                    )));
                }
                outcome.already_present += 1;
                continue;
            }

            let slot_key = Storage::key_account_entry(&entry.account_id, entry.account_version);
            if self
                .storage
                .get_for_update_raw(txn, CF_ACCOUNT_ENTRIES, &slot_key)?
                .is_some()
            {
                return Err(Error::InvariantViolation(format!(
                    "Account {} already has an entry at version {}",
                    entry.account_id, entry.account_version
                )));
            }

            let id_bytes = entry.id.as_bytes();
            self.storage.put(txn, CF_ENTRIES, id_bytes, entry)?;
            self.storage.put_raw(txn, CF_TRANSFER_KEYS, &unique_key, id_bytes)?;
            self.storage.put_raw(txn, CF_ACCOUNT_ENTRIES, &slot_key, id_bytes)?;
            outcome.appended += 1;
        }

        Ok(outcome)
    }

    /// Entry by id
    pub fn get_entry(&self, id: Uuid) -> Result<LedgerEntry> {
        self.storage
            .get(CF_ENTRIES, id.as_bytes())?
            .ok_or_else(|| Error::InvariantViolation(format!("Indexed entry {} missing", id)))
    }

    /// Every entry of a transfer
    pub fn transfer_entries(&self, transfer_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let mut ids = Vec::new();
        self.storage
            .scan_prefix(CF_TRANSFER_KEYS, transfer_id.as_bytes(), |_, value| {
                ids.push(Storage::entry_id_from_value(value)?);
                Ok(true)
            })?;

        ids.into_iter().map(|id| self.get_entry(id)).collect()
    }

    /// Every entry of an account, oldest first
    pub fn account_entries(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        self.for_each_account_entry(account, |entry| {
            entries.push(entry);
            Ok(true)
        })?;
        Ok(entries)
    }

    /// Balance derived purely from the log
    pub fn replay(&self, account: &AccountId) -> Result<i64> {
        Ok(self.replay_summary(account)?.balance)
    }

    /// Fold an account's entries in commit order
    pub fn replay_summary(&self, account: &AccountId) -> Result<ReplaySummary> {
        self.replay_through(account, u64::MAX)
    }

    /// Fold entries up to and including `version`
    ///
    /// Pairs with an account read at `version`: entries committed after that
    /// read are ignored, so store and log are compared at the same point.
    pub fn replay_through(&self, account: &AccountId, version: u64) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        self.for_each_account_entry(account, |entry| {
            if entry.account_version > version {
                return Ok(false);
            }
            summary.balance = summary
                .balance
                .checked_add(entry.signed_amount())
                .ok_or_else(|| {
                    Error::InvariantViolation(format!("Replay of {} overflows", account))
                })?;
            summary.entry_count += 1;
            summary.last_version = summary.last_version.max(entry.account_version);
            Ok(true)
        })?;

        Ok(summary)
    }

    /// One page of history, newest first
    ///
    /// Pages are 1-based.
    pub fn history(
        &self,
        account: &AccountId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<LedgerEntry>> {
        if page == 0 || page_size == 0 {
            return Err(Error::InvalidRequest(format!(
                "Page {} with size {} is out of range",
                page, page_size
            )));
        }

        let skip = (page - 1).saturating_mul(page_size);
        let prefix = Storage::key_account_entries_prefix(account);
        let upper = Storage::key_account_entry(account, u64::MAX);

        let mut ids = Vec::with_capacity(page_size);
        let mut seen = 0usize;
        self.storage
            .scan_prefix_rev(CF_ACCOUNT_ENTRIES, &prefix, &upper, |_, value| {
                seen += 1;
                if seen <= skip {
                    return Ok(true);
                }
                ids.push(Storage::entry_id_from_value(value)?);
                Ok(ids.len() < page_size)
            })?;

        ids.into_iter().map(|id| self.get_entry(id)).collect()
    }

    /// Transfers whose entries break the pairing rule
    ///
    /// Paired kinds need one debit and one credit of equal amount; every
    /// other kind needs exactly one entry.
    pub fn audit_transfers(&self) -> Result<Vec<Uuid>> {
        let mut broken = Vec::new();
        let mut current: Option<Uuid> = None;
        let mut group: Vec<Uuid> = Vec::new();

        self.storage.scan_prefix(CF_TRANSFER_KEYS, &[], |key, value| {
            let transfer_id = Storage::transfer_id_from_key(key)?;
            if current != Some(transfer_id) {
                if let Some(done) = current.take() {
                    if !self.group_is_well_formed(&group)? {
                        broken.push(done);
                    }
                }
                group.clear();
                current = Some(transfer_id);
            }
            group.push(Storage::entry_id_from_value(value)?);
            Ok(true)
        })?;

        if let Some(done) = current {
            if !self.group_is_well_formed(&group)? {
                broken.push(done);
            }
        }

        Ok(broken)
    }

    fn group_is_well_formed(&self, ids: &[Uuid]) -> Result<bool> {
        let entries = ids
            .iter()
            .map(|id| self.get_entry(*id))
            .collect::<Result<Vec<_>>>()?;

        let Some(first) = entries.first() else {
            return Ok(false);
        };

        if !first.kind.is_paired() {
            return Ok(entries.len() == 1);
        }

        if entries.len() != 2 {
            return Ok(false);
        }

        let debit = entries.iter().find(|e| e.direction == Direction::Debit);
        let credit = entries.iter().find(|e| e.direction == Direction::Credit);
        Ok(match (debit, credit) {
            (Some(d), Some(c)) => d.amount == c.amount && d.kind == c.kind,
            _ => false,
        })
    }

    /// Visit entries oldest first; the visitor returns `false` to stop
    fn for_each_account_entry<F>(&self, account: &AccountId, mut visit: F) -> Result<()>
    where
        F: FnMut(LedgerEntry) -> Result<bool>,
    {
        let prefix = Storage::key_account_entries_prefix(account);
        self.storage
            .scan_prefix(CF_ACCOUNT_ENTRIES, &prefix, |_, value| {
                let entry = self.get_entry(Storage::entry_id_from_value(value)?)?;
                visit(entry)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryKind, EntryStatus};
    use crate::Config;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_log() -> (LedgerLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (LedgerLog::new(storage), temp_dir)
    }

    fn entry(
        transfer_id: Uuid,
        account: &str,
        direction: Direction,
        amount: i64,
        version: u64,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::now_v7(),
            transfer_id,
            account_id: AccountId::new(account),
            direction,
            amount,
            resulting_balance: 0,
            account_version: version,
            timestamp: Utc::now(),
            description: "test".to_string(),
            status: EntryStatus::Completed,
            kind: EntryKind::Transfer,
            counterparty: None,
            reverses: None,
        }
    }

    fn pair(amount: i64, debit_version: u64, credit_version: u64) -> Vec<LedgerEntry> {
        let transfer_id = Uuid::now_v7();
        vec![
            entry(transfer_id, "alice", Direction::Debit, amount, debit_version),
            entry(transfer_id, "bob", Direction::Credit, amount, credit_version),
        ]
    }

    #[test]
    fn test_append_twice_is_idempotent() {
        let (log, _temp) = test_log();
        let batch = pair(300, 1, 1);

        let first = log.append(&batch).unwrap();
        assert_eq!(first.appended, 2);
        assert_eq!(first.already_present, 0);

        let second = log.append(&batch).unwrap();
        assert_eq!(second.appended, 0);
        assert_eq!(second.already_present, 2);

        assert_eq!(log.transfer_entries(batch[0].transfer_id).unwrap().len(), 2);
        assert_eq!(log.account_entries(&AccountId::new("alice")).unwrap().len(), 1);
    }

    #[test]
    fn test_reappend_with_fresh_entry_ids_still_deduplicates() {
        let (log, _temp) = test_log();
        let batch = pair(300, 1, 1);
        log.append(&batch).unwrap();

        // A retry after a crash rebuilds entries with new ids but the same key
        let retry: Vec<LedgerEntry> = batch
            .iter()
            .map(|e| LedgerEntry {
                id: Uuid::now_v7(),
                ..e.clone()
            })
            .collect();
        let outcome = log.append(&retry).unwrap();
        assert_eq!(outcome.already_present, 2);
        assert_eq!(log.transfer_entries(batch[0].transfer_id).unwrap().len(), 2);
    }

    #[test]
    fn test_conflicting_reappend_rejected() {
        let (log, _temp) = test_log();
        let batch = pair(300, 1, 1);
        log.append(&batch).unwrap();

        let mut tampered = batch.clone();
        tampered[0].amount = 301;
        assert!(matches!(
            log.append(&tampered),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (log, _temp) = test_log();
        log.append(&pair(100, 1, 1)).unwrap();

        // Second side collides with bob's version-1 slot, so the debit must not land
        let bad = pair(50, 2, 1);
        assert!(log.append(&bad).is_err());
        assert!(log.transfer_entries(bad[0].transfer_id).unwrap().is_empty());
        assert_eq!(log.account_entries(&AccountId::new("alice")).unwrap().len(), 1);
    }

    #[test]
    fn test_mixed_transfer_ids_rejected() {
        let (log, _temp) = test_log();
        let mut batch = pair(10, 1, 1);
        batch[1].transfer_id = Uuid::now_v7();
        assert!(log.append(&batch).is_err());
    }

    #[test]
    fn test_replay_folds_credits_and_debits() {
        let (log, _temp) = test_log();
        let alice = AccountId::new("alice");

        let mut deposit = entry(Uuid::now_v7(), "alice", Direction::Credit, 1000, 1);
        deposit.kind = EntryKind::Deposit;
        log.append(&[deposit]).unwrap();
        log.append(&pair(300, 2, 1)).unwrap();

        let summary = log.replay_summary(&alice).unwrap();
        assert_eq!(summary.balance, 700);
        assert_eq!(summary.entry_count, 2);
        assert_eq!(summary.last_version, 2);
        assert_eq!(log.replay(&AccountId::new("bob")).unwrap(), 300);
        assert_eq!(log.replay(&AccountId::new("nobody")).unwrap(), 0);

        let through_first = log.replay_through(&alice, 1).unwrap();
        assert_eq!(through_first.balance, 1000);
        assert_eq!(through_first.entry_count, 1);
    }

    #[test]
    fn test_history_newest_first_paged() {
        let (log, _temp) = test_log();
        let alice = AccountId::new("alice");

        for version in 1..=5u64 {
            let mut credit = entry(
                Uuid::now_v7(),
                "alice",
                Direction::Credit,
                version as i64,
                version,
            );
            credit.kind = EntryKind::Deposit;
            log.append(&[credit]).unwrap();
        }

        let page1 = log.history(&alice, 1, 2).unwrap();
        assert_eq!(
            page1.iter().map(|e| e.account_version).collect::<Vec<_>>(),
            vec![5, 4]
        );

        let page3 = log.history(&alice, 3, 2).unwrap();
        assert_eq!(
            page3.iter().map(|e| e.account_version).collect::<Vec<_>>(),
            vec![1]
        );

        assert!(log.history(&alice, 4, 2).unwrap().is_empty());
        assert!(matches!(
            log.history(&alice, 0, 2),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_audit_flags_half_transfers() {
        let (log, _temp) = test_log();
        log.append(&pair(100, 1, 1)).unwrap();

        let lonely = entry(Uuid::now_v7(), "alice", Direction::Debit, 40, 2);
        let lonely_id = lonely.transfer_id;
        log.append(&[lonely]).unwrap();

        let mut deposit = entry(Uuid::now_v7(), "carol", Direction::Credit, 10, 1);
        deposit.kind = EntryKind::Deposit;
        log.append(&[deposit]).unwrap();

        assert_eq!(log.audit_transfers().unwrap(), vec![lonely_id]);
    }
}
