// ledger/src/lib.rs
//! # purse-ledger
//!
//! A per-user spendable balance paired with an append-only purchase ledger.
//!
//! Every purchase debits the balance and writes one immutable
//! [`Transaction`] that snapshots the balance before and after the debit.
//! The ledger append and the balance compare-and-set commit as a single
//! storage transaction, ledger row first, so a debit never exists without
//! its record and a record never outlives a failed debit.
//!
//! ```rust,ignore
//! let purse = Purse::new(Box::new(PostgresAdapter::from_pool(pool)));
//! let receipt = purse
//!     .purchase(PurchaseRequest::new(user, 30, "sku-1"))
//!     .await?;
//! assert_eq!(receipt.new_balance, 70);
//! ```
//!
//! Concurrency safety comes from the store's conditional write, not from
//! process-local locks: several processes can share one database.

pub mod adapters;
pub mod balance;
pub mod config;
pub mod error;
pub mod history;
pub mod purchase;
pub mod reconcile;
pub mod request;
pub mod response;
pub mod transaction;

pub use balance::{Balance, CasOutcome};
pub use config::{PurseConfig, RetryPolicy};
pub use error::PurseError;
pub use history::TransactionHistory;
pub use purchase::{PurchasePlan, PurchaseReceipt};
pub use reconcile::{ReconcileReport, Reconciler};
pub use request::{PurchaseRequest, ValidPurchase};
pub use response::{PurchaseResponse, ResponseBody};
pub use transaction::{ItemId, Transaction, TransactionKind, TransactionStatus};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Keys are scoped to the user, so two users never share a hash.
pub(crate) fn hash_idempotency_key(user_id: Uuid, key: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(user_id.as_bytes());
    hasher.update(key.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Keyed storage of one balance per user.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// `None` when the user has no balance row.
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>, PurseError>;

    /// Replace the stored value only if it still equals `expected`.
    async fn compare_and_set(
        &self,
        user_id: Uuid,
        expected: u64,
        new_value: u64,
    ) -> Result<CasOutcome, PurseError>;

    /// Create the balance row for a user. Never used by the purchase path.
    async fn open_balance(&self, user_id: Uuid, initial: u64) -> Result<Balance, PurseError>;
}

/// Append-only transaction log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, record: &Transaction) -> Result<(), PurseError>;

    async fn get_transaction(&self, id: Uuid) -> Result<Transaction, PurseError>;

    /// One page of a user's records in creation order, strictly after `after`.
    async fn list_for_user(
        &self,
        user_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Transaction>, PurseError>;

    async fn find_by_idempotency_key(
        &self,
        idempotency_hash: &str,
    ) -> Result<Option<Transaction>, PurseError>;
}

/// Storage backend for the purchase path.
#[async_trait]
pub trait PurseAdapter: BalanceStore + LedgerStore {
    /// Commit a purchase plan atomically.
    /// Implementors MUST:
    /// 1. BEGIN a storage transaction
    /// 2. Append `plan.record` to the ledger
    /// 3. Compare-and-set the balance from `plan.expected_current` to
    ///    `plan.record.balance_after`
    /// 4. COMMIT only if the CAS applied; otherwise ROLLBACK so the record
    ///    from step 2 disappears, and return `Conflict` or `NotFound`
    /// 5. ROLLBACK on any error, returning `DuplicateIdempotencyKey` when
    ///    the record's idempotency hash is already taken
    async fn execute_purchase(&self, plan: &PurchasePlan) -> Result<CasOutcome, PurseError>;
}

/// Entry point holding the storage adapter and retry policy.
#[derive(Clone)]
pub struct Purse {
    adapter: Arc<dyn PurseAdapter>,
    retry: RetryPolicy,
}

impl Purse {
    pub fn new(adapter: Box<dyn PurseAdapter>) -> Self {
        Self {
            adapter: adapter.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_arc(adapter: Arc<dyn PurseAdapter>) -> Self {
        Self {
            adapter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Result<Self, PurseError> {
        retry.validate()?;
        self.retry = retry;
        Ok(self)
    }

    /// Get adapter reference
    pub fn adapter(&self) -> &dyn PurseAdapter {
        self.adapter.as_ref()
    }

    pub fn adapter_arc(&self) -> Arc<dyn PurseAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<Balance, PurseError> {
        self.adapter
            .get_balance(user_id)
            .await?
            .ok_or(PurseError::NoBalanceFound)
    }

    /// Lazy, restartable view over a user's ledger.
    pub fn history(&self, user_id: Uuid) -> TransactionHistory {
        TransactionHistory::new(self.adapter_arc(), user_id)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.adapter_arc())
    }
}
