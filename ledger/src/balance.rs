// ledger/src/balance.rs
use chrono::{DateTime, Utc};

use crate::transaction::now;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The spendable amount of one user, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: Uuid,
    pub total_balance: u64,
    /// Time of the last write. A purchase commit sets it no earlier than its
    /// record's `created_at`.
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(user_id: Uuid, total_balance: u64) -> Self {
        Self {
            user_id,
            total_balance,
            updated_at: now(),
        }
    }

    pub fn covers(&self, amount: u64) -> bool {
        self.total_balance >= amount
    }
}

/// Result of a conditional balance write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored value no longer matched the expected one.
    Conflict,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers() {
        let balance = Balance::new(Uuid::now_v7(), 100);
        assert!(balance.covers(100));
        assert!(balance.covers(30));
        assert!(!balance.covers(101));
    }
}
