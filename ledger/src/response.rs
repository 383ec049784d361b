// ledger/src/response.rs
use serde::Serialize;

use crate::{PurchaseReceipt, PurchaseRequest, Purse, PurseError, Transaction};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_INTERNAL: u16 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<u64>,
}

/// HTTP-shaped result of a purchase, ready for a router to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl PurchaseResponse {
    pub fn from_result(result: Result<PurchaseReceipt, PurseError>) -> Self {
        match result {
            Ok(receipt) => Self {
                status: STATUS_OK,
                body: ResponseBody {
                    message: "Purchase successful".to_string(),
                    transaction: Some(receipt.transaction),
                    new_balance: Some(receipt.new_balance),
                },
            },
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn from_error(err: &PurseError) -> Self {
        let (status, message) = match err {
            PurseError::InvalidRequest(_) => {
                (STATUS_BAD_REQUEST, "Amount and item ID are required.")
            }
            PurseError::NoBalanceFound => (STATUS_BAD_REQUEST, "No balance found for this user."),
            PurseError::InsufficientBalance { .. } => (STATUS_BAD_REQUEST, "Insufficient balance."),
            other => {
                tracing::error!(error = %other, "purchase failed");
                (STATUS_INTERNAL, "Internal server error")
            }
        };

        Self {
            status,
            body: ResponseBody {
                message: message.to_string(),
                transaction: None,
                new_balance: None,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.body).unwrap_or_else(|_| {
            serde_json::json!({ "message": "Internal server error" })
        })
    }
}

impl Purse {
    /// [`purchase`](Purse::purchase) mapped onto a status and JSON body.
    pub async fn purchase_response(&self, request: PurchaseRequest) -> PurchaseResponse {
        PurchaseResponse::from_result(self.purchase(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemId;
    use uuid::Uuid;

    #[test]
    fn test_success_body() {
        let tx =
            Transaction::purchase(Uuid::now_v7(), 30, ItemId::parse("X").unwrap(), 100, None)
                .unwrap();
        let response = PurchaseResponse::from_result(Ok(PurchaseReceipt {
            transaction: tx,
            new_balance: 70,
            replayed: false,
        }));

        assert_eq!(response.status, 200);
        let json = response.to_json();
        assert_eq!(json["message"], "Purchase successful");
        assert_eq!(json["newBalance"], 70);
        assert_eq!(json["transaction"]["balanceBefore"], 100);
        assert_eq!(json["transaction"]["balanceAfter"], 70);
    }

    #[test]
    fn test_client_errors_are_400() {
        let cases = [
            (
                PurseError::InvalidRequest("amount".into()),
                "Amount and item ID are required.",
            ),
            (PurseError::NoBalanceFound, "No balance found for this user."),
            (
                PurseError::InsufficientBalance {
                    available: 20,
                    requested: 30,
                },
                "Insufficient balance.",
            ),
        ];

        for (err, message) in cases {
            let response = PurchaseResponse::from_error(&err);
            assert_eq!(response.status, 400);
            assert_eq!(response.body.message, message);
            assert!(response.to_json().get("transaction").is_none());
        }
    }

    #[test]
    fn test_internal_cause_is_not_leaked() {
        let response =
            PurchaseResponse::from_error(&PurseError::Persistence("relation does not exist".into()));
        assert_eq!(response.status, 500);
        assert_eq!(response.body.message, "Internal server error");
        assert!(!response.to_json().to_string().contains("relation"));

        let contended = PurchaseResponse::from_error(&PurseError::Contention { attempts: 5 });
        assert_eq!(contended.status, 500);
    }
}
