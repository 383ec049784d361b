//! Property-based tests for balance and ledger invariants
//!
//! Random purchase sequences run against the in-memory store; whatever the
//! order and size of the debits, the balance never overdraws and the ledger
//! always explains the live value.

use proptest::prelude::*;
use purse_ledger::adapters::MemoryAdapter;
use purse_ledger::{
    BalanceStore, PurchaseRequest, Purse, PurseError, Transaction, TransactionStatus,
};
use uuid::Uuid;

struct Run {
    outcomes: Vec<Result<u64, PurseError>>,
    final_balance: u64,
    ledger: Vec<Transaction>,
    verified: usize,
}

fn run_sequence(initial: u64, amounts: &[u64]) -> Run {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let adapter = MemoryAdapter::new();
        let purse = Purse::new(Box::new(adapter.clone()));
        let user = Uuid::now_v7();
        adapter.open_balance(user, initial).await.unwrap();

        let mut outcomes = Vec::new();
        for amount in amounts {
            let result = purse
                .purchase(PurchaseRequest::new(user, *amount, "sku"))
                .await
                .map(|receipt| receipt.new_balance);
            outcomes.push(result);
        }

        Run {
            outcomes,
            final_balance: purse.balance(user).await.unwrap().total_balance,
            ledger: purse.history(user).collect_remaining().await.unwrap(),
            verified: purse.reconciler().verify_chain(user).await.unwrap(),
        }
    })
}

// ============================================================================
// Balance Invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a purchase succeeds exactly when the balance covers it,
    /// and the balance drops by exactly the amount
    #[test]
    fn purchase_succeeds_iff_covered(
        initial in 0u64..1_000,
        amounts in prop::collection::vec(1u64..300, 1..20),
    ) {
        let run = run_sequence(initial, &amounts);
        let mut expected = initial;

        for (amount, outcome) in amounts.iter().zip(&run.outcomes) {
            if *amount <= expected {
                expected -= amount;
                prop_assert_eq!(outcome.as_ref().ok(), Some(&expected));
            } else {
                let refused = matches!(outcome, Err(PurseError::InsufficientBalance { .. }));
                prop_assert!(refused);
            }
        }

        prop_assert_eq!(run.final_balance, expected);
    }

    /// Property: initial - sum(successful amounts) == live balance,
    /// and the last record's after-snapshot is the live balance
    #[test]
    fn ledger_explains_balance(
        initial in 0u64..1_000,
        amounts in prop::collection::vec(1u64..300, 1..20),
    ) {
        let run = run_sequence(initial, &amounts);

        let spent: u64 = run
            .ledger
            .iter()
            .filter(|t| t.status == TransactionStatus::Successful)
            .map(|t| t.amount)
            .sum();
        prop_assert_eq!(initial - spent, run.final_balance);

        match run.ledger.last() {
            Some(last) => prop_assert_eq!(last.balance_after, run.final_balance),
            None => prop_assert_eq!(run.final_balance, initial),
        }

        // Refused purchases leave nothing behind.
        let committed = run.outcomes.iter().filter(|o| o.is_ok()).count();
        prop_assert_eq!(run.ledger.len(), committed);
        prop_assert_eq!(run.verified, committed);
    }

    /// Property: consecutive records chain, each starting where the last ended
    #[test]
    fn records_chain_in_order(
        initial in 1u64..1_000,
        amounts in prop::collection::vec(1u64..100, 1..20),
    ) {
        let run = run_sequence(initial, &amounts);

        if let Some(first) = run.ledger.first() {
            prop_assert_eq!(first.balance_before, initial);
        }
        for pair in run.ledger.windows(2) {
            prop_assert_eq!(pair[0].balance_after, pair[1].balance_before);
            prop_assert!(pair[0].created_at <= pair[1].created_at);
        }
    }
}
