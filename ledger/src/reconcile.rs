// ledger/src/reconcile.rs
use metrics::counter;
use std::sync::Arc;
use uuid::Uuid;

use crate::{CasOutcome, PurseAdapter, PurseError, Transaction, TransactionHistory};

/// Outcome of comparing a live balance with the ledger tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileReport {
    Consistent,
    /// The last successful record had not been applied; it now is.
    Repaired { transaction_id: Uuid },
    /// Neither applied nor provably pending. Left untouched for manual review.
    Diverged { expected: u64, actual: u64 },
}

/// Uses the ledger as source of truth to find and repair balances that
/// missed their last debit.
pub struct Reconciler {
    adapter: Arc<dyn PurseAdapter>,
}

impl Reconciler {
    pub fn new(adapter: Arc<dyn PurseAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn reconcile_user(&self, user_id: Uuid) -> Result<ReconcileReport, PurseError> {
        let balance = self
            .adapter
            .get_balance(user_id)
            .await?
            .ok_or(PurseError::NoBalanceFound)?;

        let Some(last) = self.last_successful(user_id).await? else {
            return Ok(ReconcileReport::Consistent);
        };

        if balance.total_balance == last.balance_after {
            return Ok(ReconcileReport::Consistent);
        }

        // Unapplied only if the record is newer than the last balance write.
        let unapplied = balance.total_balance == last.balance_before
            && balance.updated_at < last.created_at;

        if !unapplied {
            tracing::warn!(
                user_id = %user_id,
                expected = last.balance_after,
                actual = balance.total_balance,
                "balance diverged from ledger"
            );
            return Ok(ReconcileReport::Diverged {
                expected: last.balance_after,
                actual: balance.total_balance,
            });
        }

        match self
            .adapter
            .compare_and_set(user_id, last.balance_before, last.balance_after)
            .await?
        {
            CasOutcome::Applied => {
                counter!("purse.reconcile.repaired").increment(1);
                tracing::info!(
                    user_id = %user_id,
                    transaction_id = %last.id,
                    "applied pending ledger entry"
                );
                Ok(ReconcileReport::Repaired {
                    transaction_id: last.id,
                })
            }
            CasOutcome::NotFound => Err(PurseError::NoBalanceFound),
            // Someone moved the balance meanwhile; let the caller run again.
            CasOutcome::Conflict => Err(PurseError::Contention { attempts: 1 }),
        }
    }

    /// Walk the full history and check every record conserves value.
    /// Returns the number of successful records seen.
    pub async fn verify_chain(&self, user_id: Uuid) -> Result<usize, PurseError> {
        let mut history = TransactionHistory::new(Arc::clone(&self.adapter), user_id);
        let mut successful = 0;

        while let Some(record) = history.next().await? {
            if record.user_id != user_id {
                return Err(PurseError::InvariantViolation(format!(
                    "record {} belongs to another user",
                    record.id
                )));
            }
            if !record.is_conserving() {
                return Err(PurseError::InvariantViolation(format!(
                    "record {}: {} - {} != {}",
                    record.id, record.balance_before, record.amount, record.balance_after
                )));
            }
            if record.is_successful() {
                successful += 1;
            }
        }

        Ok(successful)
    }

    async fn last_successful(&self, user_id: Uuid) -> Result<Option<Transaction>, PurseError> {
        let mut history = TransactionHistory::new(Arc::clone(&self.adapter), user_id);
        let mut last = None;
        while let Some(record) = history.next().await? {
            if record.is_successful() {
                last = Some(record);
            }
        }
        Ok(last)
    }
}
