// ledger/src/purchase.rs
use metrics::{counter, histogram};
use serde::Serialize;

use crate::{
    Balance, CasOutcome, PurchaseRequest, Purse, PurseAdapter, PurseError, RetryPolicy,
    Transaction, ValidPurchase,
};

/// What a single commit attempt writes: the record, and the balance value the
/// record was computed from.
#[derive(Debug, Clone)]
pub struct PurchasePlan {
    pub record: Transaction,
    pub expected_current: u64,
}

impl PurchasePlan {
    /// Builds a fresh plan against a freshly read balance.
    pub fn build(purchase: &ValidPurchase, balance: &Balance) -> Result<Self, PurseError> {
        if !balance.covers(purchase.amount) {
            return Err(PurseError::InsufficientBalance {
                available: balance.total_balance,
                requested: purchase.amount,
            });
        }

        let record = Transaction::purchase(
            purchase.user_id,
            purchase.amount,
            purchase.item_id.clone(),
            balance.total_balance,
            purchase.idempotency_hash.clone(),
        )?;

        Ok(Self {
            record,
            expected_current: balance.total_balance,
        })
    }

    pub fn new_value(&self) -> u64 {
        self.record.balance_after
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub transaction: Transaction,
    pub new_balance: u64,
    /// Set when an earlier request with the same idempotency key already
    /// committed this transaction.
    #[serde(skip)]
    pub replayed: bool,
}

impl PurchaseReceipt {
    fn committed(transaction: Transaction) -> Self {
        Self {
            new_balance: transaction.balance_after,
            transaction,
            replayed: false,
        }
    }

    /// Replays `existing` only if it is the same purchase as `purchase`.
    fn replay(purchase: &ValidPurchase, existing: Transaction) -> Result<Self, PurseError> {
        if existing.user_id != purchase.user_id
            || existing.amount != purchase.amount
            || existing.item_id != purchase.item_id
        {
            tracing::info!(
                user_id = %purchase.user_id,
                transaction_id = %existing.id,
                "idempotency key reused for a different purchase"
            );
            return Err(PurseError::InvalidRequest(
                "idempotencyKey already used for a different purchase".to_string(),
            ));
        }

        Ok(Self {
            new_balance: existing.balance_after,
            transaction: existing,
            replayed: true,
        })
    }
}

impl Purse {
    /// Validate, debit and record one purchase.
    ///
    /// The commit runs on its own task: once validation passes, dropping the
    /// returned future does not stop the debit from completing.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt, PurseError> {
        let purchase = match request.validate() {
            Ok(purchase) => purchase,
            Err(err) => {
                tracing::info!(error = %err, "purchase rejected");
                counter!("purse.purchases.total", "status" => "rejected").increment(1);
                return Err(err);
            }
        };

        tracing::debug!(
            user_id = %purchase.user_id,
            amount = purchase.amount,
            item_id = %purchase.item_id,
            "purchase accepted"
        );

        let adapter = self.adapter_arc();
        let retry = self.retry_policy().clone();
        let handle =
            tokio::spawn(async move { commit_with_retry(adapter.as_ref(), &retry, purchase).await });

        let result = handle
            .await
            .map_err(|e| PurseError::Internal(format!("purchase task failed: {}", e)))
            .and_then(|result| result);

        counter!("purse.purchases.total", "status" => outcome_label(&result)).increment(1);
        if let Ok(receipt) = &result {
            if !receipt.replayed {
                histogram!("purse.purchase.amount").record(receipt.transaction.amount as f64);
            }
        }

        result
    }
}

fn outcome_label(result: &Result<PurchaseReceipt, PurseError>) -> &'static str {
    match result {
        Ok(receipt) if receipt.replayed => "replayed",
        Ok(_) => "success",
        Err(err) if err.is_client_error() => "rejected",
        Err(PurseError::Contention { .. }) => "contention",
        Err(_) => "failed",
    }
}

async fn commit_with_retry(
    adapter: &dyn PurseAdapter,
    retry: &RetryPolicy,
    purchase: ValidPurchase,
) -> Result<PurchaseReceipt, PurseError> {
    if let Some(hash) = purchase.idempotency_hash.as_deref() {
        if let Some(existing) = adapter.find_by_idempotency_key(hash).await? {
            tracing::info!(transaction_id = %existing.id, "purchase replayed from idempotency key");
            return PurchaseReceipt::replay(&purchase, existing);
        }
    }

    let mut last_observed = None;

    for attempt in 1..=retry.max_attempts {
        let balance = adapter
            .get_balance(purchase.user_id)
            .await?
            .ok_or(PurseError::NoBalanceFound)?;

        // Sufficiency is re-checked against every fresh read.
        let plan = match PurchasePlan::build(&purchase, &balance) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::info!(
                    user_id = %purchase.user_id,
                    amount = purchase.amount,
                    available = balance.total_balance,
                    "purchase refused"
                );
                return Err(err);
            }
        };
        last_observed = Some(balance.total_balance);

        match adapter.execute_purchase(&plan).await {
            Ok(CasOutcome::Applied) => {
                tracing::info!(
                    user_id = %purchase.user_id,
                    transaction_id = %plan.record.id,
                    balance_before = plan.record.balance_before,
                    balance_after = plan.record.balance_after,
                    attempt,
                    "purchase committed"
                );
                return Ok(PurchaseReceipt::committed(plan.record));
            }
            Ok(CasOutcome::NotFound) => return Err(PurseError::NoBalanceFound),
            Ok(CasOutcome::Conflict) => {
                counter!("purse.cas.conflicts").increment(1);
                tracing::debug!(user_id = %purchase.user_id, attempt, "balance changed underneath, retrying");
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
            Err(PurseError::DuplicateIdempotencyKey(existing_id)) => {
                let existing = adapter.get_transaction(existing_id).await?;
                tracing::info!(transaction_id = %existing.id, "concurrent duplicate resolved as replay");
                return PurchaseReceipt::replay(&purchase, existing);
            }
            Err(err) => {
                tracing::error!(
                    user_id = %purchase.user_id,
                    transaction_id = %plan.record.id,
                    error = %err,
                    "purchase commit failed"
                );
                return Err(err);
            }
        }
    }

    if let Some(observed) = last_observed {
        let audit = Transaction::failed_purchase(
            purchase.user_id,
            purchase.amount,
            purchase.item_id.clone(),
            observed,
        );
        if let Err(err) = adapter.append(&audit).await {
            tracing::error!(error = %err, "failed to record contended purchase");
        }
    }

    tracing::warn!(
        user_id = %purchase.user_id,
        attempts = retry.max_attempts,
        "purchase gave up under contention"
    );
    Err(PurseError::Contention {
        attempts: retry.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemId;
    use uuid::Uuid;

    fn valid(amount: u64) -> ValidPurchase {
        ValidPurchase {
            user_id: Uuid::now_v7(),
            amount,
            item_id: ItemId::parse("X").unwrap(),
            idempotency_hash: None,
        }
    }

    #[test]
    fn test_plan_snapshots_balance() {
        let purchase = valid(30);
        let balance = Balance::new(purchase.user_id, 100);
        let plan = PurchasePlan::build(&purchase, &balance).unwrap();

        assert_eq!(plan.expected_current, 100);
        assert_eq!(plan.new_value(), 70);
        assert_eq!(plan.record.balance_before, 100);
        assert!(plan.record.is_successful());
    }

    #[test]
    fn test_plan_refuses_overdraft() {
        let purchase = valid(30);
        let balance = Balance::new(purchase.user_id, 20);
        assert!(matches!(
            PurchasePlan::build(&purchase, &balance),
            Err(PurseError::InsufficientBalance {
                available: 20,
                requested: 30
            })
        ));
    }

    #[test]
    fn test_plans_get_fresh_records() {
        let purchase = valid(10);
        let balance = Balance::new(purchase.user_id, 100);
        let first = PurchasePlan::build(&purchase, &balance).unwrap();
        let second = PurchasePlan::build(&purchase, &balance).unwrap();
        assert_ne!(first.record.id, second.record.id);
    }

    #[test]
    fn test_replay_requires_same_purchase() {
        let purchase = valid(30);
        let stored = PurchasePlan::build(&purchase, &Balance::new(purchase.user_id, 100))
            .unwrap()
            .record;

        let receipt = PurchaseReceipt::replay(&purchase, stored.clone()).unwrap();
        assert!(receipt.replayed);
        assert_eq!(receipt.new_balance, 70);

        let other_user = ValidPurchase {
            user_id: Uuid::now_v7(),
            ..purchase.clone()
        };
        assert!(matches!(
            PurchaseReceipt::replay(&other_user, stored.clone()),
            Err(PurseError::InvalidRequest(_))
        ));

        let other_amount = ValidPurchase {
            amount: 31,
            ..purchase.clone()
        };
        assert!(matches!(
            PurchaseReceipt::replay(&other_amount, stored.clone()),
            Err(PurseError::InvalidRequest(_))
        ));

        let other_item = ValidPurchase {
            item_id: ItemId::parse("Y").unwrap(),
            ..purchase
        };
        assert!(matches!(
            PurchaseReceipt::replay(&other_item, stored),
            Err(PurseError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            outcome_label(&Err(PurseError::NoBalanceFound)),
            "rejected"
        );
        assert_eq!(
            outcome_label(&Err(PurseError::Contention { attempts: 5 })),
            "contention"
        );
        assert_eq!(
            outcome_label(&Err(PurseError::Persistence("x".into()))),
            "failed"
        );
    }
}
