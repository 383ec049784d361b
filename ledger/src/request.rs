// ledger/src/request.rs
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ItemId, PurseError, hash_idempotency_key};

/// Raw purchase input as delivered by the request context.
///
/// `user_id` comes from the authenticated identity, never from the body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    #[serde(skip)]
    pub user_id: Option<Uuid>,
    pub amount: Option<Value>,
    pub item_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// A purchase that passed input validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPurchase {
    pub user_id: Uuid,
    pub amount: u64,
    pub item_id: ItemId,
    pub idempotency_hash: Option<String>,
}

impl PurchaseRequest {
    pub fn new(user_id: Uuid, amount: u64, item_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            amount: Some(Value::from(amount)),
            item_id: Some(item_id.into()),
            idempotency_key: None,
        }
    }

    /// Parses a JSON body and attaches the caller identity.
    pub fn from_body(user_id: Option<Uuid>, body: &[u8]) -> Result<Self, PurseError> {
        let mut request: PurchaseRequest = serde_json::from_slice(body)
            .map_err(|e| PurseError::InvalidRequest(format!("malformed body: {}", e)))?;
        request.user_id = user_id;
        Ok(request)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<ValidPurchase, PurseError> {
        let user_id = self
            .user_id
            .ok_or_else(|| PurseError::InvalidRequest("missing user identity".to_string()))?;

        let amount = parse_amount(self.amount.as_ref())?;

        let item_id = self
            .item_id
            .as_deref()
            .ok_or_else(|| PurseError::InvalidRequest("missing itemId".to_string()))
            .and_then(ItemId::parse)?;

        let idempotency_hash = match self.idempotency_key.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(key) => Some(hash_idempotency_key(user_id, key)),
        };

        Ok(ValidPurchase {
            user_id,
            amount,
            item_id,
            idempotency_hash,
        })
    }
}

/// Amounts are positive integers in minor units that fit a signed 64-bit column.
fn parse_amount(raw: Option<&Value>) -> Result<u64, PurseError> {
    let value = raw.ok_or_else(|| PurseError::InvalidRequest("missing amount".to_string()))?;

    let amount = match value {
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| PurseError::InvalidRequest(format!("amount is not a whole number: {}", value)))?;

    if amount == 0 || amount > i64::MAX as u64 {
        return Err(PurseError::InvalidRequest(format!(
            "amount out of range: {}",
            amount
        )));
    }

    Ok(amount)
}
