// ledger/src/error.rs
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PurseError {
    /// Missing or malformed purchase input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No balance found")]
    NoBalanceFound,

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    /// Compare-and-set kept losing to concurrent purchases.
    #[error("Contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Balance already exists")]
    BalanceExists,

    /// A record with the same idempotency key is already in the ledger.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PurseError {
    /// Errors caused by the caller. These are safe to report verbatim.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::NoBalanceFound | Self::InsufficientBalance { .. }
        )
    }
}

impl From<sqlx::Error> for PurseError {
    fn from(err: sqlx::Error) -> Self {
        PurseError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(PurseError::InvalidRequest("amount".into()).is_client_error());
        assert!(PurseError::NoBalanceFound.is_client_error());
        assert!(
            PurseError::InsufficientBalance {
                available: 20,
                requested: 30
            }
            .is_client_error()
        );
        assert!(!PurseError::Contention { attempts: 5 }.is_client_error());
        assert!(!PurseError::Persistence("disk".into()).is_client_error());
    }

    #[test]
    fn test_display() {
        let err = PurseError::InsufficientBalance {
            available: 20,
            requested: 30,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: available 20, requested 30"
        );
    }
}
