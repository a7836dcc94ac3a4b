//! Reconciler
//!
//! Replays each account's log and compares it with the stored balance. Drift
//! is reported, never raised to live callers, and corrected only by appending
//! an `Adjustment` entry so the log explains the stored balance again.
//!
//! # Architecture
//!
//! ```text
//! Ledger facade ──► ReconcilerHandle (Clone)
//!                        │
//!                        │ mpsc::channel (bounded)
//!                        ▼
//!                 ReconcilerActor (single task)
//!                   ├─ mailbox: on-demand requests
//!                   └─ interval: periodic reconcile_all (+ auto-correct)
//!                        │
//!                        ▼ spawn_blocking
//!                   Reconciler (replay + compare)
//! ```
//!
//! The actor never sits on the transfer path; live writers and the
//! reconciler only meet through optimistic transactions.

use crate::{
    accounts::AccountStore,
    engine::new_entry,
    log::LedgerLog,
    metrics::Metrics,
    storage::Storage,
    types::{Account, AccountId, Direction, EntryKind, LedgerEntry},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use uuid::Uuid;

/// Store vs log comparison for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Account checked
    pub account_id: AccountId,
    /// Balance held by the account store
    pub current_balance: i64,
    /// Balance derived from the log
    pub replayed_balance: i64,
    /// `current_balance - replayed_balance`
    pub drift: i64,
    /// Account version the comparison was made at
    pub version: u64,
    /// Entries folded by the replay
    pub entry_count: u64,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

impl ReconcileReport {
    /// Whether store and log agree
    pub fn is_balanced(&self) -> bool {
        self.drift == 0
    }
}

/// Result of a batch reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    /// Accounts checked
    pub total_accounts: usize,
    /// Accounts without drift
    pub balanced_accounts: usize,
    /// Accounts with drift
    pub drifted_accounts: usize,
    /// Sum of absolute drift
    pub total_drift: i64,
    /// Per-account reports
    pub reports: Vec<ReconcileReport>,
    /// Transfers whose entries break the debit/credit pairing
    pub unpaired_transfers: Vec<Uuid>,
    /// When the batch finished
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationSummary {
    /// Reports with non-zero drift
    pub fn drifted(&self) -> impl Iterator<Item = &ReconcileReport> {
        self.reports.iter().filter(|r| !r.is_balanced())
    }
}

/// Replay-and-compare over shared storage
#[derive(Debug, Clone)]
pub struct Reconciler {
    storage: Arc<Storage>,
    accounts: AccountStore,
    log: LedgerLog,
    metrics: Metrics,
    last_summary: Arc<RwLock<Option<ReconciliationSummary>>>,
}

impl Reconciler {
    /// Create reconciler
    pub fn new(
        storage: Arc<Storage>,
        accounts: AccountStore,
        log: LedgerLog,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            accounts,
            log,
            metrics,
            last_summary: Arc::new(RwLock::new(None)),
        }
    }

    /// Compare one account's stored balance with its replayed log
    pub fn reconcile(&self, account_id: &AccountId) -> Result<ReconcileReport> {
        let account = self.accounts.get(account_id)?;
        self.reconcile_account(&account)
    }

    fn reconcile_account(&self, account: &Account) -> Result<ReconcileReport> {
        let replay = self.log.replay_through(&account.id, account.version)?;

        let drift = account.balance.checked_sub(replay.balance).ok_or_else(|| {
            Error::InvariantViolation(format!("Drift of {} overflows", account.id))
        })?;

        let report = ReconcileReport {
            account_id: account.id.clone(),
            current_balance: account.balance,
            replayed_balance: replay.balance,
            drift,
            version: account.version,
            entry_count: replay.entry_count,
            checked_at: Utc::now(),
        };

        if !report.is_balanced() {
            self.metrics.record_drift();
            tracing::warn!(
                account_id = %account.id,
                current_balance = report.current_balance,
                replayed_balance = report.replayed_balance,
                drift,
                version = account.version,
                "DriftDetected"
            );
        }

        Ok(report)
    }

    /// Reconcile every account and audit transfer pairing
    pub fn reconcile_all(&self) -> Result<ReconciliationSummary> {
        let accounts = self.accounts.list()?;

        let mut reports = Vec::with_capacity(accounts.len());
        let mut total_drift: i64 = 0;
        for account in &accounts {
            let report = self.reconcile_account(account)?;
            total_drift = total_drift.saturating_add(report.drift.saturating_abs());
            reports.push(report);
        }

        let unpaired_transfers = self.log.audit_transfers()?;
        if !unpaired_transfers.is_empty() {
            tracing::warn!(
                count = unpaired_transfers.len(),
                first = %unpaired_transfers[0],
                "Transfers with unpaired entries"
            );
        }

        let drifted_accounts = reports.iter().filter(|r| !r.is_balanced()).count();
        let summary = ReconciliationSummary {
            total_accounts: reports.len(),
            balanced_accounts: reports.len() - drifted_accounts,
            drifted_accounts,
            total_drift,
            reports,
            unpaired_transfers,
            completed_at: Utc::now(),
        };

        tracing::info!(
            total_accounts = summary.total_accounts,
            drifted_accounts = summary.drifted_accounts,
            total_drift = summary.total_drift,
            unpaired_transfers = summary.unpaired_transfers.len(),
            "Reconciliation completed"
        );

        *self.last_summary.write() = Some(summary.clone());

        Ok(summary)
    }

    /// Append an adjustment so the log explains the stored balance
    ///
    /// Returns `None` when there is nothing to correct. A live mutation that
    /// lands between the read and the commit fails this with
    /// [`Error::VersionConflict`].
    pub fn correct(&self, account_id: &AccountId) -> Result<Option<LedgerEntry>> {
        let account = self.accounts.get(account_id)?;
        let report = self.reconcile_account(&account)?;
        if report.is_balanced() {
            return Ok(None);
        }

        let direction = if report.drift > 0 {
            Direction::Credit
        } else {
            Direction::Debit
        };
        let amount = report
            .drift
            .checked_abs()
            .ok_or_else(|| {
                Error::InvariantViolation(format!("Drift of {} overflows", account_id))
            })?;

        let now = Utc::now();
        let txn = self.storage.transaction();

        // Same balance, next version: the adjustment takes that version's slot
        let updated = self
            .accounts
            .commit(&txn, account_id, account.balance, account.version, now)?;

        let entry = LedgerEntry {
            description: format!(
                "Reconciliation adjustment: store {} vs log {}",
                report.current_balance, report.replayed_balance
            ),
            ..new_entry(Uuid::now_v7(), EntryKind::Adjustment, &updated, direction, amount, now)
        };
        self.log.append_in(&txn, std::slice::from_ref(&entry))?;

        self.storage.commit(txn)?;

        self.metrics.record_correction();
        tracing::info!(
            account_id = %account_id,
            transfer_id = %entry.transfer_id,
            direction = %direction,
            amount,
            "Drift corrected"
        );

        Ok(Some(entry))
    }

    /// Summary of the most recent batch run
    pub fn last_summary(&self) -> Option<ReconciliationSummary> {
        self.last_summary.read().clone()
    }
}

/// Message sent to the reconciler actor
#[derive(Debug)]
pub enum ReconcilerMessage {
    /// Reconcile one account
    ReconcileAccount {
        /// Account to check
        account_id: AccountId,
        /// Reply channel
        response: oneshot::Sender<Result<ReconcileReport>>,
    },

    /// Reconcile every account
    ReconcileAll {
        /// Reply channel
        response: oneshot::Sender<Result<ReconciliationSummary>>,
    },

    /// Correct one account's drift
    Correct {
        /// Account to correct
        account_id: AccountId,
        /// Reply channel
        response: oneshot::Sender<Result<Option<LedgerEntry>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that runs reconciliation off the request path
#[derive(Debug)]
pub struct ReconcilerActor {
    reconciler: Reconciler,

    /// Mailbox for on-demand requests
    mailbox: mpsc::Receiver<ReconcilerMessage>,

    /// Time between scheduled runs
    period: Duration,

    /// Correct drifted accounts after each scheduled run
    auto_correct: bool,
}

impl ReconcilerActor {
    /// Create new actor
    pub fn new(
        reconciler: Reconciler,
        mailbox: mpsc::Receiver<ReconcilerMessage>,
        period: Duration,
        auto_correct: bool,
    ) -> Self {
        Self {
            reconciler,
            mailbox,
            period,
            auto_correct,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(ReconcilerMessage::Shutdown) | None => break,
                        Some(msg) => self.handle_message(msg).await,
                    }
                }

                _ = ticker.tick() => {
                    self.run_scheduled().await;
                }
            }
        }

        tracing::debug!("Reconciler stopped");
    }

    async fn handle_message(&self, msg: ReconcilerMessage) {
        match msg {
            ReconcilerMessage::ReconcileAccount { account_id, response } => {
                let result = self.blocking(move |r| r.reconcile(&account_id)).await;
                let _ = response.send(result);
            }

            ReconcilerMessage::ReconcileAll { response } => {
                let result = self.blocking(|r| r.reconcile_all()).await;
                let _ = response.send(result);
            }

            ReconcilerMessage::Correct { account_id, response } => {
                let result = self.blocking(move |r| r.correct(&account_id)).await;
                let _ = response.send(result);
            }

            ReconcilerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    async fn run_scheduled(&self) {
        let summary = match self.blocking(|r| r.reconcile_all()).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "Scheduled reconciliation failed");
                return;
            }
        };

        if !self.auto_correct {
            return;
        }

        for report in summary.drifted() {
            let account_id = report.account_id.clone();
            match self.blocking(move |r| r.correct(&account_id)).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        account_id = %report.account_id,
                        "Account moved during correction, retrying next run"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        account_id = %report.account_id,
                        error = %e,
                        "Drift correction failed"
                    );
                }
            }
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Reconciler) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let reconciler = self.reconciler.clone();
        tokio::task::spawn_blocking(move || work(reconciler)).await?
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    sender: mpsc::Sender<ReconcilerMessage>,
}

impl ReconcilerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ReconcilerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReconcilerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Reconciler mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Reconcile one account
    pub async fn reconcile(&self, account_id: AccountId) -> Result<ReconcileReport> {
        self.request(|response| ReconcilerMessage::ReconcileAccount {
            account_id,
            response,
        })
        .await
    }

    /// Reconcile every account
    pub async fn reconcile_all(&self) -> Result<ReconciliationSummary> {
        self.request(|response| ReconcilerMessage::ReconcileAll { response })
            .await
    }

    /// Correct one account
    pub async fn correct(&self, account_id: AccountId) -> Result<Option<LedgerEntry>> {
        self.request(|response| ReconcilerMessage::Correct {
            account_id,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ReconcilerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Reconciler mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the reconciler actor
pub fn spawn_reconciler(
    reconciler: Reconciler,
    period: Duration,
    auto_correct: bool,
    mailbox_capacity: usize,
) -> (ReconcilerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let actor = ReconcilerActor::new(reconciler, rx, period, auto_correct);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (ReconcilerHandle::new(tx), task)
}
