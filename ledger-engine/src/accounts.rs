//! Account store
//!
//! Durable `account_id -> (balance, version)` mapping. Balances change only
//! through [`AccountStore::commit`], which compares the caller's captured
//! version with the stored one inside a storage transaction.

use crate::{
    storage::{Storage, Txn, CF_ACCOUNTS},
    types::{Account, AccountId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Versioned balance store
#[derive(Debug, Clone)]
pub struct AccountStore {
    storage: Arc<Storage>,
}

impl AccountStore {
    /// Create store over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Current account state
    pub fn get(&self, id: &AccountId) -> Result<Account> {
        self.storage
            .get(CF_ACCOUNTS, &Storage::key_account(id))?
            .ok_or_else(|| Error::AccountNotFound(id.clone()))
    }

    /// Whether the account exists
    pub fn exists(&self, id: &AccountId) -> Result<bool> {
        Ok(self
            .storage
            .get_raw(CF_ACCOUNTS, &Storage::key_account(id))?
            .is_some())
    }

    /// Read inside `txn`, registering the account for conflict detection
    pub fn get_for_update(&self, txn: &Txn<'_>, id: &AccountId) -> Result<Account> {
        self.storage
            .get_for_update(txn, CF_ACCOUNTS, &Storage::key_account(id))?
            .ok_or_else(|| Error::AccountNotFound(id.clone()))
    }

    /// Stage a new balance if the stored version still equals `expected_version`
    ///
    /// Returns the account as it will look once `txn` commits. Nothing is
    /// staged when the version moved or the balance would go negative.
    pub fn commit(
        &self,
        txn: &Txn<'_>,
        id: &AccountId,
        new_balance: i64,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        let current = self.get_for_update(txn, id)?;

        if current.version != expected_version {
            return Err(Error::VersionConflict(format!(
                "{}: expected version {}, found {}",
                id, expected_version, current.version
            )));
        }

        if new_balance < 0 {
            return Err(Error::InsufficientFunds {
                account: id.clone(),
                required: current.balance - new_balance,
                available: current.balance,
            });
        }

        let updated = Account {
            balance: new_balance,
            version: current.version + 1,
            updated_at: now,
            ..current
        };

        self.storage
            .put(txn, CF_ACCOUNTS, &Storage::key_account(id), &updated)?;

        Ok(updated)
    }

    /// Stage a brand-new account at version 0 with zero balance
    pub fn create(&self, txn: &Txn<'_>, id: &AccountId, now: DateTime<Utc>) -> Result<Account> {
        id.validate()?;

        let key = Storage::key_account(id);
        if self.storage.get_for_update_raw(txn, CF_ACCOUNTS, &key)?.is_some() {
            return Err(Error::AccountExists(id.clone()));
        }

        let account = Account {
            id: id.clone(),
            balance: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.storage.put(txn, CF_ACCOUNTS, &key, &account)?;

        Ok(account)
    }

    /// Every account, in id order
    pub fn list(&self) -> Result<Vec<Account>> {
        let mut accounts = Vec::new();
        self.storage.scan_prefix(CF_ACCOUNTS, &[], |_, value| {
            accounts.push(bincode::deserialize::<Account>(value)?);
            Ok(true)
        })?;
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn test_store() -> (AccountStore, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (AccountStore::new(storage.clone()), storage, temp_dir)
    }

    fn seed(store: &AccountStore, storage: &Storage, id: &str, balance: i64) -> Account {
        let id = AccountId::new(id);
        let txn = storage.transaction();
        let created = store.create(&txn, &id, Utc::now()).unwrap();
        let account = store
            .commit(&txn, &id, balance, created.version, Utc::now())
            .unwrap();
        storage.commit(txn).unwrap();
        account
    }

    #[test]
    fn test_create_and_get() {
        let (store, storage, _temp) = test_store();
        let account = seed(&store, &storage, "alice", 1000);

        assert_eq!(account.balance, 1000);
        assert_eq!(account.version, 1);
        assert_eq!(store.get(&AccountId::new("alice")).unwrap(), account);
        assert!(matches!(
            store.get(&AccountId::new("bob")),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_create_twice_fails() {
        let (store, storage, _temp) = test_store();
        seed(&store, &storage, "alice", 0);

        let txn = storage.transaction();
        let result = store.create(&txn, &AccountId::new("alice"), Utc::now());
        assert!(matches!(result, Err(Error::AccountExists(_))));
    }

    #[test]
    fn test_commit_with_stale_version_conflicts() {
        let (store, storage, _temp) = test_store();
        let account = seed(&store, &storage, "alice", 1000);

        let txn = storage.transaction();
        let result = store.commit(&txn, &account.id, 900, account.version - 1, Utc::now());
        assert!(matches!(result, Err(Error::VersionConflict(_))));
        drop(txn);

        assert_eq!(store.get(&account.id).unwrap().balance, 1000);
    }

    #[test]
    fn test_commit_negative_balance_rejected() {
        let (store, storage, _temp) = test_store();
        let account = seed(&store, &storage, "alice", 100);

        let txn = storage.transaction();
        let result = store.commit(&txn, &account.id, -50, account.version, Utc::now());
        match result {
            Err(Error::InsufficientFunds {
                required,
                available,
                ..
            }) => {
                assert_eq!(required, 150);
                assert_eq!(available, 100);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_two_commits_same_version_only_one_wins() {
        let (store, storage, _temp) = test_store();
        let account = seed(&store, &storage, "alice", 1000);

        let t1 = storage.transaction();
        let t2 = storage.transaction();
        store
            .commit(&t1, &account.id, 400, account.version, Utc::now())
            .unwrap();
        store
            .commit(&t2, &account.id, 300, account.version, Utc::now())
            .unwrap();

        storage.commit(t1).unwrap();
        assert!(matches!(storage.commit(t2), Err(Error::VersionConflict(_))));

        let stored = store.get(&account.id).unwrap();
        assert_eq!(stored.balance, 400);
        assert_eq!(stored.version, account.version + 1);
    }

    #[test]
    fn test_list_returns_all_accounts() {
        let (store, storage, _temp) = test_store();
        seed(&store, &storage, "carol", 1);
        seed(&store, &storage, "alice", 2);
        seed(&store, &storage, "bob", 3);

        let ids: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|a| a.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }
}
