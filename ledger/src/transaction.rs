// ledger/src/transaction.rs
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::PurseError;

pub const MAX_ITEM_ID_LEN: usize = 128;

/// Opaque catalog identifier of the purchased good.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn parse(raw: &str) -> Result<Self, PurseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PurseError::InvalidRequest("itemId is empty".to_string()));
        }
        if trimmed.len() > MAX_ITEM_ID_LEN {
            return Err(PurseError::InvalidRequest(format!(
                "itemId longer than {} bytes",
                MAX_ITEM_ID_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchase,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = PurseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            other => Err(PurseError::Persistence(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Successful,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = PurseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            other => Err(PurseError::Persistence(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Microsecond precision, same as `TIMESTAMPTZ`. Every record and balance
/// timestamp comes from here.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: u64,
    pub status: TransactionStatus,
    pub balance_before: u64,
    pub balance_after: u64,
    pub item_id: ItemId,
    #[serde(skip)]
    pub idempotency_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Builds a successful purchase record debiting `amount` from `balance_before`.
    pub fn purchase(
        user_id: Uuid,
        amount: u64,
        item_id: ItemId,
        balance_before: u64,
        idempotency_hash: Option<String>,
    ) -> Result<Self, PurseError> {
        let balance_after =
            balance_before
                .checked_sub(amount)
                .ok_or(PurseError::InsufficientBalance {
                    available: balance_before,
                    requested: amount,
                })?;

        Ok(Self {
            id: Uuid::now_v7(),
            user_id,
            kind: TransactionKind::Purchase,
            amount,
            status: TransactionStatus::Successful,
            balance_before,
            balance_after,
            item_id,
            idempotency_hash,
            created_at: now(),
        })
    }

    /// Audit entry for an attempt that reached the commit step but never applied.
    /// The balance is untouched, so before and after are equal.
    pub fn failed_purchase(user_id: Uuid, amount: u64, item_id: ItemId, observed: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind: TransactionKind::Purchase,
            amount,
            status: TransactionStatus::Failed,
            balance_before: observed,
            balance_after: observed,
            item_id,
            idempotency_hash: None,
            created_at: now(),
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.status, TransactionStatus::Successful)
    }

    /// `balance_after == balance_before - amount` for successful records,
    /// `balance_after == balance_before` for failed ones.
    pub fn is_conserving(&self) -> bool {
        match self.status {
            TransactionStatus::Successful => {
                self.balance_before.checked_sub(self.amount) == Some(self.balance_after)
            }
            TransactionStatus::Failed => self.balance_before == self.balance_after,
        }
    }
}
