// ledger/src/adapters/memory.rs
use crate::transaction::now;
use crate::{
    Balance, BalanceStore, CasOutcome, LedgerStore, PurchasePlan, PurseAdapter, PurseError,
    Transaction,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Failures the memory store can be told to produce on its next purchase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The ledger write is rejected.
    FailLedgerAppend,
    /// The process dies after the ledger row is written but before the
    /// balance write, so the open storage transaction never commits.
    CrashAfterLedgerAppend,
    /// The balance write is rejected after the ledger row was staged.
    FailBalanceCommit,
    /// The next `n` commits lose the compare-and-set.
    ForceConflicts(u32),
}

#[derive(Default)]
struct MemoryStore {
    balances: HashMap<Uuid, Balance>,
    transactions: HashMap<Uuid, Transaction>,
    by_user: HashMap<Uuid, Vec<Uuid>>,
    by_idempotency: HashMap<String, Uuid>,
    pending_faults: Vec<Fault>,
    forced_conflicts: u32,
}

impl MemoryStore {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.pending_faults.iter().position(|f| *f == fault) {
            Some(idx) => {
                self.pending_faults.remove(idx);
                true
            }
            None => false,
        }
    }

    fn check_unique(&self, record: &Transaction) -> Result<(), PurseError> {
        if let Some(hash) = &record.idempotency_hash {
            if let Some(existing) = self.by_idempotency.get(hash) {
                return Err(PurseError::DuplicateIdempotencyKey(*existing));
            }
        }
        if self.transactions.contains_key(&record.id) {
            return Err(PurseError::Persistence(format!(
                "duplicate transaction id {}",
                record.id
            )));
        }
        Ok(())
    }

    fn insert_record(&mut self, record: Transaction) {
        if let Some(hash) = &record.idempotency_hash {
            self.by_idempotency.insert(hash.clone(), record.id);
        }
        self.by_user
            .entry(record.user_id)
            .or_default()
            .push(record.id);
        self.transactions.insert(record.id, record);
    }
}

/// Process-local store. Each operation is atomic; nothing is held across
/// suspension points.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        let mut store = self.store.lock();
        match fault {
            Fault::ForceConflicts(n) => store.forced_conflicts += n,
            other => store.pending_faults.push(other),
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.store.lock().transactions.len()
    }
}

#[async_trait]
impl BalanceStore for MemoryAdapter {
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>, PurseError> {
        tokio::task::yield_now().await;
        Ok(self.store.lock().balances.get(&user_id).cloned())
    }

    async fn compare_and_set(
        &self,
        user_id: Uuid,
        expected: u64,
        new_value: u64,
    ) -> Result<CasOutcome, PurseError> {
        tokio::task::yield_now().await;
        let mut store = self.store.lock();
        let Some(balance) = store.balances.get_mut(&user_id) else {
            return Ok(CasOutcome::NotFound);
        };
        if balance.total_balance != expected {
            return Ok(CasOutcome::Conflict);
        }
        balance.total_balance = new_value;
        balance.updated_at = now();
        Ok(CasOutcome::Applied)
    }

    async fn open_balance(&self, user_id: Uuid, initial: u64) -> Result<Balance, PurseError> {
        let mut store = self.store.lock();
        if store.balances.contains_key(&user_id) {
            return Err(PurseError::BalanceExists);
        }
        let balance = Balance::new(user_id, initial);
        store.balances.insert(user_id, balance.clone());
        Ok(balance)
    }
}

#[async_trait]
impl LedgerStore for MemoryAdapter {
    async fn append(&self, record: &Transaction) -> Result<(), PurseError> {
        tokio::task::yield_now().await;
        let mut store = self.store.lock();
        if store.take_fault(Fault::FailLedgerAppend) {
            return Err(PurseError::Persistence(
                "injected: ledger append failed".to_string(),
            ));
        }
        store.check_unique(record)?;
        store.insert_record(record.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Transaction, PurseError> {
        self.store
            .lock()
            .transactions
            .get(&id)
            .cloned()
            .ok_or(PurseError::TransactionNotFound(id))
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Transaction>, PurseError> {
        tokio::task::yield_now().await;
        let store = self.store.lock();
        let Some(ids) = store.by_user.get(&user_id) else {
            return Ok(Vec::new());
        };

        let start = match after {
            Some(cursor) => match ids.iter().position(|id| *id == cursor) {
                Some(idx) => idx + 1,
                None => return Err(PurseError::TransactionNotFound(cursor)),
            },
            None => 0,
        };

        Ok(ids
            .iter()
            .skip(start)
            .take(limit)
            .filter_map(|id| store.transactions.get(id).cloned())
            .collect())
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_hash: &str,
    ) -> Result<Option<Transaction>, PurseError> {
        let store = self.store.lock();
        Ok(store
            .by_idempotency
            .get(idempotency_hash)
            .and_then(|id| store.transactions.get(id))
            .cloned())
    }
}

#[async_trait]
impl PurseAdapter for MemoryAdapter {
    async fn execute_purchase(&self, plan: &PurchasePlan) -> Result<CasOutcome, PurseError> {
        tokio::task::yield_now().await;
        let mut store = self.store.lock();
        let record = &plan.record;

        if !record.is_successful() || !record.is_conserving() {
            return Err(PurseError::InvariantViolation(format!(
                "plan record {} does not describe a debit",
                record.id
            )));
        }

        // BEGIN: stage the ledger row first.
        if store.take_fault(Fault::FailLedgerAppend) {
            return Err(PurseError::Persistence(
                "injected: ledger append failed".to_string(),
            ));
        }
        store.check_unique(record)?;
        let staged = record.clone();

        if store.take_fault(Fault::CrashAfterLedgerAppend) {
            drop(staged);
            return Err(PurseError::Persistence(
                "injected: crashed before balance commit".to_string(),
            ));
        }

        if store.forced_conflicts > 0 {
            store.forced_conflicts -= 1;
            return Ok(CasOutcome::Conflict);
        }

        let fail_commit = store.take_fault(Fault::FailBalanceCommit);
        let Some(balance) = store.balances.get_mut(&record.user_id) else {
            return Ok(CasOutcome::NotFound);
        };
        if balance.total_balance != plan.expected_current {
            return Ok(CasOutcome::Conflict);
        }
        if fail_commit {
            return Err(PurseError::Persistence(
                "injected: balance commit failed".to_string(),
            ));
        }

        // COMMIT: balance and ledger row become visible together.
        balance.total_balance = plan.new_value();
        balance.updated_at = now().max(record.created_at);
        store.insert_record(staged);

        Ok(CasOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemId;

    fn plan(user: Uuid, before: u64, amount: u64) -> PurchasePlan {
        PurchasePlan {
            record: Transaction::purchase(user, amount, ItemId::parse("X").unwrap(), before, None)
                .unwrap(),
            expected_current: before,
        }
    }

    #[tokio::test]
    async fn test_open_balance_once() {
        let adapter = MemoryAdapter::new();
        let user = Uuid::now_v7();
        adapter.open_balance(user, 100).await.unwrap();
        assert!(matches!(
            adapter.open_balance(user, 5).await,
            Err(PurseError::BalanceExists)
        ));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let adapter = MemoryAdapter::new();
        let user = Uuid::now_v7();
        adapter.open_balance(user, 100).await.unwrap();

        assert_eq!(
            adapter.compare_and_set(user, 90, 50).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            adapter.compare_and_set(user, 100, 70).await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(
            adapter
                .compare_and_set(Uuid::now_v7(), 0, 0)
                .await
                .unwrap(),
            CasOutcome::NotFound
        );
        assert_eq!(
            adapter.get_balance(user).await.unwrap().unwrap().total_balance,
            70
        );
    }

    #[tokio::test]
    async fn test_conflict_leaves_no_record() {
        let adapter = MemoryAdapter::new();
        let user = Uuid::now_v7();
        adapter.open_balance(user, 100).await.unwrap();

        let stale = plan(user, 90, 30);
        assert_eq!(
            adapter.execute_purchase(&stale).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(adapter.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let adapter = MemoryAdapter::new();
        let user = Uuid::now_v7();
        adapter.open_balance(user, 100).await.unwrap();
        adapter.inject(Fault::FailBalanceCommit);

        assert!(adapter.execute_purchase(&plan(user, 100, 30)).await.is_err());
        assert_eq!(adapter.transaction_count(), 0);
        assert_eq!(
            adapter.execute_purchase(&plan(user, 100, 30)).await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(adapter.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_list_pages_in_order() {
        let adapter = MemoryAdapter::new();
        let user = Uuid::now_v7();
        adapter.open_balance(user, 100).await.unwrap();

        let mut ids = Vec::new();
        for before in [100, 90, 80] {
            let p = plan(user, before, 10);
            ids.push(p.record.id);
            adapter.execute_purchase(&p).await.unwrap();
        }

        let first = adapter.list_for_user(user, None, 2).await.unwrap();
        assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), ids[..2].to_vec());

        let rest = adapter.list_for_user(user, Some(ids[1]), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[2]);
    }
}
