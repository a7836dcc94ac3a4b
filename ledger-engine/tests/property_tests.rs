//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Money conservation: transfers never change the total
//! - No negative balances, whatever the sequence of requests
//! - Replay equivalence: the log explains every stored balance
//! - Decimal conversion is exact for whole minor units

use ledger_engine::{
    config::LimitPolicy, minor_units_from_decimal, AccountId, Config, Error, Ledger,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;

const ACCOUNTS: usize = 4;

/// Strategy for generating transfer requests between a few accounts
fn transfer_strategy() -> impl Strategy<Value = (usize, usize, i64)> {
    (0..ACCOUNTS, 0..ACCOUNTS, 1i64..600)
}

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.reconciler.enabled = false; // Reconcile explicitly in tests
    config.limits.deposit = LimitPolicy::unlimited();
    config.limits.transfer = LimitPolicy::unlimited();

    (Ledger::open(config).await.unwrap(), temp_dir)
}

fn account(index: usize) -> AccountId {
    AccountId::new(format!("user-{}", index))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: any sequence of transfers conserves money, keeps balances
    /// non-negative and stays explainable by the log
    #[test]
    fn prop_transfers_conserve_money(
        openings in prop::collection::vec(0i64..1_000, ACCOUNTS),
        transfers in prop::collection::vec(transfer_strategy(), 1..40),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            let mut model = openings.clone();
            for (i, opening) in openings.iter().enumerate() {
                ledger.open_account(&account(i), *opening).await.unwrap();
            }
            let total: i64 = openings.iter().sum();

            for (from, to, amount) in transfers {
                let result = ledger.transfer(&account(from), &account(to), amount, None).await;

                if from == to {
                    prop_assert!(matches!(result, Err(Error::InvalidRequest(_))));
                } else if model[from] >= amount {
                    let result = result.unwrap();
                    model[from] -= amount;
                    model[to] += amount;
                    prop_assert_eq!(result.new_from_balance, model[from]);
                    prop_assert_eq!(result.new_to_balance, model[to]);
                } else {
                    prop_assert!(
                        matches!(result, Err(Error::InsufficientFunds { .. })),
                        "Expected InsufficientFunds"
                    );
                }
            }

            let mut sum = 0;
            for (i, expected) in model.iter().enumerate() {
                let balance = ledger.get_balance(&account(i)).await.unwrap();
                prop_assert!(balance >= 0);
                prop_assert_eq!(balance, *expected);
                sum += balance;
            }
            prop_assert_eq!(sum, total);

            let summary = ledger.reconcile_all().await.unwrap();
            prop_assert_eq!(summary.total_accounts, ACCOUNTS);
            prop_assert_eq!(summary.drifted_accounts, 0);
            prop_assert!(summary.unpaired_transfers.is_empty());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: deposits add exactly their amount and nothing else
    #[test]
    fn prop_deposits_add_exactly(deposits in prop::collection::vec(1i64..10_000, 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let alice = account(0);
            ledger.open_account(&alice, 0).await.unwrap();

            let mut expected = 0;
            for amount in &deposits {
                expected += amount;
                let result = ledger.deposit(&alice, *amount, None).await.unwrap();
                prop_assert_eq!(result.new_balance, expected);
            }

            let report = ledger.reconcile(&alice).await.unwrap();
            prop_assert_eq!(report.replayed_balance, expected);
            prop_assert_eq!(report.entry_count, deposits.len() as u64);
            prop_assert_eq!(report.version, deposits.len() as u64);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: rejected requests leave every balance untouched
    #[test]
    fn prop_rejections_do_not_mutate(opening in 0i64..500, excess in 1i64..500) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let (alice, bob) = (account(0), account(1));
            ledger.open_account(&alice, opening).await.unwrap();
            ledger.open_account(&bob, 0).await.unwrap();

            let result = ledger.transfer(&alice, &bob, opening + excess, None).await;
            prop_assert!(
                matches!(result, Err(Error::InsufficientFunds { .. })),
                "Expected InsufficientFunds"
            );

            let result = ledger.transfer(&alice, &bob, -excess, None).await;
            prop_assert!(matches!(result, Err(Error::InvalidAmount(_))), "Expected InvalidAmount");

            let alice_after = ledger.get_account(&alice).await.unwrap();
            prop_assert_eq!(alice_after.balance, opening);
            prop_assert_eq!(alice_after.version, if opening > 0 { 1 } else { 0 });
            prop_assert_eq!(ledger.get_balance(&bob).await.unwrap(), 0);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: whole paise convert exactly, fractions of a paisa are rejected
    #[test]
    fn prop_minor_units_exact(paise in 1i64..1_000_000_000, sub in 1i64..10) {
        prop_assert_eq!(minor_units_from_decimal(Decimal::new(paise, 2), 2).unwrap(), paise);

        let too_precise = Decimal::new(paise * 10 + sub, 3);
        prop_assert!(matches!(
            minor_units_from_decimal(too_precise, 2),
            Err(Error::InvalidAmount(_))
        ));
    }
}
