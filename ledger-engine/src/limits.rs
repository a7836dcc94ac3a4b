//! Rolling-window deposit and transfer limits
//!
//! One counter per `(account, kind)`. The fail-fast check reads without
//! writing; the increment happens in [`LimitGuard::commit`], inside the same
//! storage transaction as the balance change, so two operations that both
//! passed the check cannot jointly push the counter over its ceiling.

use crate::{
    config::{LimitPolicy, LimitsConfig},
    storage::{Storage, Txn, CF_LIMITS},
    types::{AccountId, LimitCounter, LimitKind},
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    /// Operation fits; quota left once it is applied
    Allowed {
        /// Amount still available in the window
        remaining_amount: i64,
        /// Operations still available in the window
        remaining_count: u32,
    },
    /// Operation would breach the ceiling
    Exceeded {
        /// Human-readable explanation
        reason: String,
    },
}

impl LimitDecision {
    /// Whether the operation may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed { .. })
    }

    /// Convert a denial into [`Error::LimitExceeded`]
    pub fn into_result(self) -> Result<()> {
        match self {
            LimitDecision::Allowed { .. } => Ok(()),
            LimitDecision::Exceeded { reason } => Err(Error::LimitExceeded(reason)),
        }
    }
}

/// Limit guard over shared storage
#[derive(Debug, Clone)]
pub struct LimitGuard {
    storage: Arc<Storage>,
    config: LimitsConfig,
}

impl LimitGuard {
    /// Create guard with the configured ceilings
    pub fn new(storage: Arc<Storage>, config: LimitsConfig) -> Self {
        Self { storage, config }
    }

    fn policy(&self, kind: LimitKind) -> &LimitPolicy {
        match kind {
            LimitKind::Deposit => &self.config.deposit,
            LimitKind::Transfer => &self.config.transfer,
        }
    }

    fn window(&self) -> Duration {
        Duration::hours(self.config.window_hours)
    }

    /// Zero the counter if its window has elapsed
    pub fn reset_if_window_expired(&self, counter: &mut LimitCounter, now: DateTime<Utc>) -> bool {
        counter.reset_if_window_expired(now, self.window())
    }

    /// Current usage with the window applied (not persisted)
    pub fn usage(&self, account: &AccountId, kind: LimitKind) -> Result<LimitCounter> {
        self.usage_at(account, kind, Utc::now())
    }

    fn usage_at(
        &self,
        account: &AccountId,
        kind: LimitKind,
        now: DateTime<Utc>,
    ) -> Result<LimitCounter> {
        let mut counter = self
            .storage
            .get::<LimitCounter>(CF_LIMITS, &Storage::key_limit(account, kind))?
            .unwrap_or_else(|| LimitCounter::new(account.clone(), kind, now));
        self.reset_if_window_expired(&mut counter, now);
        Ok(counter)
    }

    /// Fail-fast check, no mutation
    pub fn check_and_reserve(
        &self,
        account: &AccountId,
        kind: LimitKind,
        amount: i64,
    ) -> Result<LimitDecision> {
        self.check_at(account, kind, amount, Utc::now())
    }

    /// [`LimitGuard::check_and_reserve`] at an explicit instant
    pub fn check_at(
        &self,
        account: &AccountId,
        kind: LimitKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<LimitDecision> {
        let policy = self.policy(kind);
        if !policy.enabled {
            return Ok(Self::evaluate(policy, kind, None, amount));
        }
        let counter = self.usage_at(account, kind, now)?;
        Ok(Self::evaluate(policy, kind, Some(&counter), amount))
    }

    /// Re-validate and stage the increment inside `txn`
    pub fn commit(
        &self,
        txn: &Txn<'_>,
        account: &AccountId,
        kind: LimitKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<LimitCounter>> {
        let policy = self.policy(kind);
        if !policy.enabled {
            return Ok(None);
        }

        let key = Storage::key_limit(account, kind);
        let mut counter = self
            .storage
            .get_for_update::<LimitCounter>(txn, CF_LIMITS, &key)?
            .unwrap_or_else(|| LimitCounter::new(account.clone(), kind, now));

        if self.reset_if_window_expired(&mut counter, now) {
            tracing::debug!(account_id = %account, kind = %kind, "Limit window rolled over");
        }

        Self::evaluate(policy, kind, Some(&counter), amount).into_result()?;

        counter.amount_in_window += amount;
        counter.count_in_window += 1;
        self.storage.put(txn, CF_LIMITS, &key, &counter)?;

        Ok(Some(counter))
    }

    fn evaluate(
        policy: &LimitPolicy,
        kind: LimitKind,
        counter: Option<&LimitCounter>,
        amount: i64,
    ) -> LimitDecision {
        let counter = match counter {
            Some(counter) if policy.enabled => counter,
            _ => {
                return LimitDecision::Allowed {
                    remaining_amount: i64::MAX,
                    remaining_count: u32::MAX,
                }
            }
        };

        if amount > policy.max_single_amount {
            return LimitDecision::Exceeded {
                reason: format!(
                    "{} of {} exceeds single {} limit {}",
                    kind, amount, kind, policy.max_single_amount
                ),
            };
        }

        if counter.count_in_window >= policy.max_count_per_window {
            return LimitDecision::Exceeded {
                reason: format!(
                    "{} count {} reached window limit {}",
                    kind, counter.count_in_window, policy.max_count_per_window
                ),
            };
        }

        let new_total = match counter.amount_in_window.checked_add(amount) {
            Some(total) if total <= policy.max_amount_per_window => total,
            _ => {
                return LimitDecision::Exceeded {
                    reason: format!(
                        "{} amount {} + {} exceeds window limit {}",
                        kind, counter.amount_in_window, amount, policy.max_amount_per_window
                    ),
                }
            }
        };

        LimitDecision::Allowed {
            remaining_amount: policy.max_amount_per_window - new_total,
            remaining_count: policy.max_count_per_window - counter.count_in_window - 1,
        }
    }
}
