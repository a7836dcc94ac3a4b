//! Main ledger orchestration layer
//!
//! Ties storage, the transfer engine, the limit guard and the reconciler
//! together behind an async API. Preconditions are checked before any I/O,
//! RocksDB work runs on the blocking pool, and version conflicts are retried
//! from scratch with backoff.
//!
//! # Example
//!
//! ```no_run
//! use ledger_engine::{AccountId, Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> ledger_engine::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let alice = AccountId::new("alice");
//!     let bob = AccountId::new("bob");
//!     ledger.open_account(&alice, 1000).await?;
//!     ledger.open_account(&bob, 500).await?;
//!
//!     let result = ledger.transfer(&alice, &bob, 300, Some("dinner")).await?;
//!     assert_eq!(result.new_from_balance, 700);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    accounts::AccountStore,
    engine::{TransferEngine, TransferRequest},
    limits::LimitGuard,
    log::LedgerLog,
    metrics::{Metrics, OUTCOME_COMMITTED},
    reconciler::{
        spawn_reconciler, ReconcileReport, Reconciler, ReconcilerHandle, ReconciliationSummary,
    },
    retry::RetryStrategy,
    storage::Storage,
    types::{
        validate_amount, Account, AccountId, DepositResult, LedgerEntry, LimitCounter, LimitKind,
        TransferResult,
    },
    Config, Error, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

/// Main ledger interface
///
/// Safe to share across tasks (`Arc<Ledger>`); there is no global lock.
pub struct Ledger {
    storage: Arc<Storage>,
    accounts: AccountStore,
    log: LedgerLog,
    limits: LimitGuard,
    engine: TransferEngine,
    reconciler: Reconciler,
    retry: RetryStrategy,
    metrics: Metrics,

    /// Background reconciler, if enabled
    background: Mutex<Option<(ReconcilerHandle, JoinHandle<()>)>>,

    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("storage", &self.storage)
            .field("service_name", &self.config.service_name)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Open storage
        let storage = Arc::new(Storage::open(&config)?);
        let stats = storage.get_stats()?;

        let metrics = Metrics::new()?;
        let accounts = AccountStore::new(storage.clone());
        let log = LedgerLog::new(storage.clone());
        let limits = LimitGuard::new(storage.clone(), config.limits.clone());
        let engine =
            TransferEngine::new(storage.clone(), accounts.clone(), log.clone(), limits.clone());
        let reconciler =
            Reconciler::new(storage.clone(), accounts.clone(), log.clone(), metrics.clone());

        // Spawn background reconciler
        let background = if config.reconciler.enabled {
            Some(spawn_reconciler(
                reconciler.clone(),
                Duration::from_secs(config.reconciler.interval_secs),
                config.reconciler.auto_correct,
                config.reconciler.mailbox_capacity,
            ))
        } else {
            None
        };

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            approx_accounts = stats.total_accounts,
            approx_entries = stats.total_entries,
            reconciler = config.reconciler.enabled,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            accounts,
            log,
            limits,
            engine,
            reconciler,
            retry: RetryStrategy::new(config.retry.clone()),
            metrics,
            background: Mutex::new(background),
            config,
        })
    }

    /// Open an account, optionally with an opening balance
    pub async fn open_account(
        &self,
        account_id: &AccountId,
        opening_balance: i64,
    ) -> Result<Account> {
        account_id.validate()?;
        if opening_balance < 0 {
            return Err(Error::InvalidAmount(format!(
                "Opening balance must not be negative, got {}",
                opening_balance
            )));
        }

        let engine = self.engine.clone();
        let id = account_id.clone();
        self.attempt("open_account", move || engine.try_open_account(&id, opening_balance))
            .await
    }

    /// Move `amount` from one account to another
    pub async fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: i64,
        description: Option<&str>,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let request = TransferRequest {
            from: from.clone(),
            to: to.clone(),
            amount,
            description: description.unwrap_or_default().to_string(),
        };

        let result = self.run_transfer(request).await;

        match &result {
            Ok(_) => {
                self.metrics.record_transfer(OUTCOME_COMMITTED);
                self.metrics
                    .record_commit_duration(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                self.metrics.record_transfer(e.kind());
                tracing::debug!(from = %from, to = %to, amount, error = %e, "Transfer rejected");
            }
        }

        result
    }

    async fn run_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        request.validate()?;
        self.check_limit(&request.from, LimitKind::Transfer, request.amount)
            .await?;

        let engine = self.engine.clone();
        self.attempt("transfer", move || engine.try_transfer(&request))
            .await
    }

    /// Credit `amount` to an account from outside the ledger
    pub async fn deposit(
        &self,
        account_id: &AccountId,
        amount: i64,
        description: Option<&str>,
    ) -> Result<DepositResult> {
        let started = Instant::now();
        let result = self
            .run_deposit(account_id, amount, description.unwrap_or_default())
            .await;

        match &result {
            Ok(_) => {
                self.metrics.record_deposit(OUTCOME_COMMITTED);
                self.metrics
                    .record_commit_duration(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                self.metrics.record_deposit(e.kind());
                tracing::debug!(account_id = %account_id, amount, error = %e, "Deposit rejected");
            }
        }

        result
    }

    async fn run_deposit(
        &self,
        account_id: &AccountId,
        amount: i64,
        description: &str,
    ) -> Result<DepositResult> {
        validate_amount(amount)?;
        account_id.validate()?;
        self.check_limit(account_id, LimitKind::Deposit, amount).await?;

        let engine = self.engine.clone();
        let id = account_id.clone();
        let description = description.to_string();
        self.attempt("deposit", move || engine.try_deposit(&id, amount, &description))
            .await
    }

    /// Undo a committed transfer with a compensating pair
    pub async fn reverse_transfer(
        &self,
        transfer_id: Uuid,
        reason: &str,
    ) -> Result<TransferResult> {
        let engine = self.engine.clone();
        let reason = reason.to_string();
        self.attempt("reverse_transfer", move || engine.try_reverse(transfer_id, &reason))
            .await
    }

    /// Current balance in minor units
    pub async fn get_balance(&self, account_id: &AccountId) -> Result<i64> {
        Ok(self.get_account(account_id).await?.balance)
    }

    /// Current account state
    pub async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        account_id.validate()?;
        let accounts = self.accounts.clone();
        let id = account_id.clone();
        blocking(move || accounts.get(&id)).await
    }

    /// One page of an account's entries, newest first
    ///
    /// Pages are 1-based; `page_size` is capped at `history.max_page_size`.
    pub async fn get_history(
        &self,
        account_id: &AccountId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<LedgerEntry>> {
        account_id.validate()?;
        if page == 0 || page_size == 0 {
            return Err(Error::InvalidRequest(format!(
                "Page {} with size {} is out of range",
                page, page_size
            )));
        }
        let page_size = page_size.min(self.config.history.max_page_size);

        let accounts = self.accounts.clone();
        let log = self.log.clone();
        let id = account_id.clone();
        blocking(move || {
            if !accounts.exists(&id)? {
                return Err(Error::AccountNotFound(id));
            }
            log.history(&id, page, page_size)
        })
        .await
    }

    /// Every entry recorded under a transfer id
    pub async fn get_transfer(&self, transfer_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let log = self.log.clone();
        let entries = blocking(move || log.transfer_entries(transfer_id)).await?;
        if entries.is_empty() {
            return Err(Error::TransferNotFound(transfer_id));
        }
        Ok(entries)
    }

    /// Usage of a limit in the current window
    pub async fn limit_usage(
        &self,
        account_id: &AccountId,
        kind: LimitKind,
    ) -> Result<LimitCounter> {
        account_id.validate()?;
        let limits = self.limits.clone();
        let id = account_id.clone();
        blocking(move || limits.usage(&id, kind)).await
    }

    /// Compare one account's stored balance with its log
    pub async fn reconcile(&self, account_id: &AccountId) -> Result<ReconcileReport> {
        account_id.validate()?;
        match self.background_handle() {
            Some(handle) => handle.reconcile(account_id.clone()).await,
            None => {
                let reconciler = self.reconciler.clone();
                let id = account_id.clone();
                blocking(move || reconciler.reconcile(&id)).await
            }
        }
    }

    /// Reconcile every account
    pub async fn reconcile_all(&self) -> Result<ReconciliationSummary> {
        match self.background_handle() {
            Some(handle) => handle.reconcile_all().await,
            None => {
                let reconciler = self.reconciler.clone();
                blocking(move || reconciler.reconcile_all()).await
            }
        }
    }

    /// Append an adjustment entry if the account has drifted
    pub async fn correct_drift(&self, account_id: &AccountId) -> Result<Option<LedgerEntry>> {
        account_id.validate()?;
        match self.background_handle() {
            Some(handle) => handle.correct(account_id.clone()).await,
            None => {
                let reconciler = self.reconciler.clone();
                let id = account_id.clone();
                blocking(move || reconciler.correct(&id)).await
            }
        }
    }

    /// Summary of the most recent batch reconciliation
    pub fn last_reconciliation(&self) -> Option<ReconciliationSummary> {
        self.reconciler.last_summary()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the background reconciler
    pub async fn shutdown(&self) -> Result<()> {
        let background = self.background.lock().take();
        if let Some((handle, task)) = background {
            handle.shutdown().await?;
            task.await?;
        }

        tracing::info!(service = %self.config.service_name, "Ledger shut down");
        Ok(())
    }

    fn background_handle(&self) -> Option<ReconcilerHandle> {
        self.background
            .lock()
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }

    /// Fail fast on a limit without mutating the counter
    async fn check_limit(
        &self,
        account_id: &AccountId,
        kind: LimitKind,
        amount: i64,
    ) -> Result<()> {
        let limits = self.limits.clone();
        let id = account_id.clone();
        blocking(move || limits.check_and_reserve(&id, kind, amount)?.into_result()).await
    }

    /// Run one engine operation under the retry policy
    async fn attempt<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let metrics = &self.metrics;
        let result = self
            .retry
            .execute_with_retry(
                || {
                    let work = work.clone();
                    async move {
                        let result = tokio::task::spawn_blocking(work).await?;
                        if matches!(result, Err(Error::VersionConflict(_))) {
                            metrics.record_version_conflict();
                        }
                        result
                    }
                },
                operation,
            )
            .await;

        if matches!(result, Err(Error::Retryable { .. })) {
            metrics.record_retries_exhausted();
        }

        result
    }
}

/// Run storage work on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EntryKind};
    use tempfile::TempDir;

    async fn test_ledger(reconciler: bool) -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.reconciler.enabled = reconciler;
        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_ledger_open_and_shutdown() {
        let (ledger, _temp) = test_ledger(true).await;
        ledger.shutdown().await.unwrap();
        // Second shutdown is a no-op
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_and_history() {
        let (ledger, _temp) = test_ledger(false).await;
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");

        ledger.open_account(&alice, 1000).await.unwrap();
        ledger.open_account(&bob, 500).await.unwrap();

        let result = ledger.transfer(&alice, &bob, 300, Some("rent")).await.unwrap();
        assert_eq!(result.new_from_balance, 700);
        assert_eq!(result.new_to_balance, 800);
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), 700);

        let history = ledger.get_history(&alice, 1, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EntryKind::Transfer);
        assert_eq!(history[0].direction, Direction::Debit);
        assert_eq!(history[0].description, "rent");
        assert_eq!(history[1].kind, EntryKind::Opening);

        let entries = ledger.get_transfer(result.transfer_id).await.unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(
            ledger
                .metrics()
                .transfers_total
                .with_label_values(&[OUTCOME_COMMITTED])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_preconditions_rejected_before_io() {
        let (ledger, _temp) = test_ledger(false).await;
        let alice = AccountId::new("alice");

        // No accounts exist; validation must win over lookups
        assert!(matches!(
            ledger.transfer(&alice, &AccountId::new("bob"), 0, None).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.transfer(&alice, &alice, 10, None).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            ledger.deposit(&AccountId::new(""), 10, None).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            ledger.get_history(&alice, 0, 10).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            ledger.get_history(&alice, 1, 10).await,
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.get_transfer(Uuid::now_v7()).await,
            Err(Error::TransferNotFound(_))
        ));
        assert!(matches!(
            ledger.open_account(&alice, -1).await,
            Err(Error::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_page_size_capped() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.reconciler.enabled = false;
        config.history.max_page_size = 3;
        let ledger = Ledger::open(config).await.unwrap();

        let alice = AccountId::new("alice");
        ledger.open_account(&alice, 0).await.unwrap();
        for _ in 0..5 {
            ledger.deposit(&alice, 10, None).await.unwrap();
        }

        assert_eq!(ledger.get_history(&alice, 1, 50).await.unwrap().len(), 3);
        assert_eq!(ledger.get_history(&alice, 2, 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_limit_usage_tracks_deposits() {
        let (ledger, _temp) = test_ledger(false).await;
        let alice = AccountId::new("alice");
        ledger.open_account(&alice, 0).await.unwrap();

        ledger.deposit(&alice, 250, None).await.unwrap();
        ledger.deposit(&alice, 50, None).await.unwrap();

        let usage = ledger.limit_usage(&alice, LimitKind::Deposit).await.unwrap();
        assert_eq!(usage.amount_in_window, 300);
        assert_eq!(usage.count_in_window, 2);

        let transfers = ledger.limit_usage(&alice, LimitKind::Transfer).await.unwrap();
        assert_eq!(transfers.amount_in_window, 0);
    }

    #[tokio::test]
    async fn test_reconcile_through_actor_and_direct() {
        for background in [true, false] {
            let (ledger, _temp) = test_ledger(background).await;
            let alice = AccountId::new("alice");
            ledger.open_account(&alice, 100).await.unwrap();
            ledger.deposit(&alice, 40, None).await.unwrap();

            let report = ledger.reconcile(&alice).await.unwrap();
            assert!(report.is_balanced());
            assert_eq!(report.replayed_balance, 140);

            let summary = ledger.reconcile_all().await.unwrap();
            assert_eq!(summary.total_accounts, 1);
            assert_eq!(ledger.last_reconciliation(), Some(summary));

            assert!(ledger.correct_drift(&alice).await.unwrap().is_none());
            ledger.shutdown().await.unwrap();
        }
    }
}
