//! Storage layer using RocksDB optimistic transactions
//!
//! # Column Families
//!
//! - `accounts` - Account balances and versions (key: account_id)
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `account_entries` - Per-account index (key: account_id || 0x00 || version)
//! - `transfer_keys` - Uniqueness constraint (key: transfer_id || direction || account_id)
//! - `limits` - Rolling-window counters (key: account_id || 0x00 || kind)
//! - `reversals` - Reversal markers (key: original transfer_id)
//!
//! Every mutation goes through a [`Txn`]. Keys read with `get_for_update`
//! are checked for concurrent writes when the transaction commits; a losing
//! writer gets [`Error::VersionConflict`] and none of its writes land.

use crate::{
    error::{Error, Result},
    types::{AccountId, Direction, LimitKind},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction as ScanDirection, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options, Transaction,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Account records
pub const CF_ACCOUNTS: &str = "accounts";
/// Ledger entries by id
pub const CF_ENTRIES: &str = "entries";
/// Per-account entry index
pub const CF_ACCOUNT_ENTRIES: &str = "account_entries";
/// Transfer uniqueness index
pub const CF_TRANSFER_KEYS: &str = "transfer_keys";
/// Limit counters
pub const CF_LIMITS: &str = "limits";
/// Reversal markers
pub const CF_REVERSALS: &str = "reversals";

const ALL_CFS: [&str; 6] = [
    CF_ACCOUNTS,
    CF_ENTRIES,
    CF_ACCOUNT_ENTRIES,
    CF_TRANSFER_KEYS,
    CF_LIMITS,
    CF_REVERSALS,
];

/// Key separator between an account id and its suffix
const SEP: u8 = 0x00;

/// Storage transaction
pub type Txn<'a> = Transaction<'a, OptimisticTransactionDB>;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: OptimisticTransactionDB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_ENTRIES, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_TRANSFER_KEYS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_LIMITS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_REVERSALS, Self::cf_options_index()),
        ];

        let db: OptimisticTransactionDB =
            OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            "Opened ledger storage"
        );

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Balances and counters are read on every request, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Transactions

    /// Begin an optimistic transaction
    pub fn transaction(&self) -> Txn<'_> {
        self.db.transaction()
    }

    /// Commit a transaction, mapping write races to `VersionConflict`
    pub fn commit(&self, txn: Txn<'_>) -> Result<()> {
        match txn.commit() {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => {
                tracing::debug!(error = %e, "Transaction lost a write race");
                Err(Error::VersionConflict(format!(
                    "concurrent write detected at commit ({})",
                    e
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    // Typed reads and writes

    /// Read and decode a value outside any transaction
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf_handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read raw bytes outside any transaction
    pub fn get_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(handle, key)?)
    }

    /// Read a value inside a transaction and track the key for conflicts
    pub fn get_for_update<T: DeserializeOwned>(
        &self,
        txn: &Txn<'_>,
        cf: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        match self.get_for_update_raw(txn, cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw variant of [`Storage::get_for_update`]
    pub fn get_for_update_raw(
        &self,
        txn: &Txn<'_>,
        cf: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        Ok(txn.get_for_update_cf(handle, key, true)?)
    }

    /// Stage an encoded value in a transaction
    pub fn put<T: Serialize>(&self, txn: &Txn<'_>, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.put_raw(txn, cf, key, &bytes)
    }

    /// Stage raw bytes in a transaction
    pub fn put_raw(&self, txn: &Txn<'_>, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.cf_handle(cf)?;
        txn.put_cf(handle, key, value)?;
        Ok(())
    }

    // Scans

    /// Visit every key under `prefix` in ascending order
    ///
    /// The visitor returns `false` to stop early.
    pub fn scan_prefix<F>(&self, cf: &str, prefix: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, ScanDirection::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Visit every key under `prefix` in descending order
    ///
    /// `upper` must sort after every key in the prefix.
    pub fn scan_prefix_rev<F>(
        &self,
        cf: &str,
        prefix: &[u8],
        upper: &[u8],
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(upper, ScanDirection::Reverse));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    // Key helpers

    /// Key of an account record
    pub fn key_account(account: &AccountId) -> Vec<u8> {
        account.as_bytes().to_vec()
    }

    /// Prefix of all index rows for an account
    pub fn key_account_entries_prefix(account: &AccountId) -> Vec<u8> {
        let mut key = account.as_bytes().to_vec();
        key.push(SEP);
        key
    }

    /// Index row for the entry that produced `version`
    pub fn key_account_entry(account: &AccountId, version: u64) -> Vec<u8> {
        let mut key = Self::key_account_entries_prefix(account);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Uniqueness key of one side of a transfer
    pub fn key_transfer(transfer_id: &Uuid, direction: Direction, account: &AccountId) -> Vec<u8> {
        let mut key = transfer_id.as_bytes().to_vec();
        key.push(direction.as_byte());
        key.extend_from_slice(account.as_bytes());
        key
    }

    /// Transfer id embedded in a uniqueness key
    pub fn transfer_id_from_key(key: &[u8]) -> Result<Uuid> {
        let bytes: [u8; 16] = key
            .get(..16)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Storage("Malformed transfer key".to_string()))?;
        Ok(Uuid::from_bytes(bytes))
    }

    /// Key of a limit counter
    pub fn key_limit(account: &AccountId, kind: LimitKind) -> Vec<u8> {
        let mut key = account.as_bytes().to_vec();
        key.push(SEP);
        key.push(kind.as_byte());
        key
    }

    /// Decode an entry id stored as an index value
    pub fn entry_id_from_value(value: &[u8]) -> Result<Uuid> {
        Uuid::from_slice(value).map_err(|e| Error::Storage(format!("Malformed entry id: {}", e)))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(CF_ACCOUNTS)?,
            total_entries: self.approximate_count(CF_ENTRIES)?,
        })
    }

    fn approximate_count(&self, cf: &str) -> Result<u64> {
        let handle = self.cf_handle(cf)?;
        let prop = self
            .db
            .property_int_value_cf(handle, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate number of accounts
    pub total_accounts: u64,
    /// Approximate number of ledger entries
    pub total_entries: u64,
}
