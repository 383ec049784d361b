use crate::transaction::now;
use crate::{
    Balance, BalanceStore, CasOutcome, ItemId, LedgerStore, PurchasePlan, PurseAdapter,
    PurseConfig, PurseError, Transaction,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const IDEMPOTENCY_CONSTRAINT: &str = "purse_transactions_idempotency_key";

const TRANSACTION_COLUMNS: &str = "id, user_id, kind, amount, status, balance_before, \
     balance_after, item_id, idempotency_hash, created_at";

#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PurseConfig) -> Result<Self, PurseError> {
        config.validate()?;
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| PurseError::Config("database_url is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the balance and ledger tables. Safe to call repeatedly.
    pub async fn init_schema(&self) -> Result<(), PurseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS purse_balances (
                user_id UUID PRIMARY KEY,
                total_balance BIGINT NOT NULL CHECK (total_balance >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS purse_transactions (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL REFERENCES purse_balances(user_id),
                kind TEXT NOT NULL CHECK (kind IN ('purchase')),
                amount BIGINT NOT NULL CHECK (amount > 0),
                status TEXT NOT NULL CHECK (status IN ('successful', 'failed')),
                balance_before BIGINT NOT NULL CHECK (balance_before >= 0),
                balance_after BIGINT NOT NULL CHECK (balance_after >= 0),
                item_id TEXT NOT NULL,
                idempotency_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT purse_transactions_idempotency_key UNIQUE (idempotency_hash),
                CONSTRAINT purse_transactions_conserving CHECK (
                    (status = 'successful' AND balance_after = balance_before - amount)
                    OR (status = 'failed' AND balance_after = balance_before)
                )
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_purse_transactions_user_created
            ON purse_transactions(user_id, created_at, id)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Ledger rows are append-only at the storage level too.
        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION purse_transactions_immutable() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'purse_transactions is append-only';
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DROP TRIGGER IF EXISTS purse_transactions_append_only ON purse_transactions")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER purse_transactions_append_only
            BEFORE UPDATE OR DELETE ON purse_transactions
            FOR EACH ROW EXECUTE FUNCTION purse_transactions_immutable()
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_transaction<'e, E>(
        executor: E,
        record: &Transaction,
        amounts: &EncodedAmounts,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO purse_transactions
                (id, user_id, kind, amount, status, balance_before, balance_after, item_id, idempotency_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.kind.as_str())
        .bind(amounts.amount)
        .bind(record.status.as_str())
        .bind(amounts.balance_before)
        .bind(amounts.balance_after)
        .bind(record.item_id.as_str())
        .bind(record.idempotency_hash.as_deref())
        .bind(record.created_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Map an insert failure, resolving idempotency clashes to the stored record.
    async fn insert_error(&self, err: sqlx::Error, record: &Transaction) -> PurseError {
        if violates(&err, UNIQUE_VIOLATION, Some(IDEMPOTENCY_CONSTRAINT)) {
            if let Some(hash) = record.idempotency_hash.as_deref() {
                return match self.find_by_idempotency_key(hash).await {
                    Ok(Some(existing)) => PurseError::DuplicateIdempotencyKey(existing.id),
                    Ok(None) => PurseError::Persistence(err.to_string()),
                    Err(lookup) => lookup,
                };
            }
        }
        PurseError::from(err)
    }
}

/// Record amounts as stored in `BIGINT` columns.
struct EncodedAmounts {
    amount: i64,
    balance_before: i64,
    balance_after: i64,
}

impl EncodedAmounts {
    fn of(record: &Transaction) -> Result<Self, PurseError> {
        Ok(Self {
            amount: to_i64(record.amount)?,
            balance_before: to_i64(record.balance_before)?,
            balance_after: to_i64(record.balance_after)?,
        })
    }
}

fn violates(err: &sqlx::Error, code: &str, constraint: Option<&str>) -> bool {
    let Some(db) = err.as_database_error() else {
        return false;
    };
    db.code().as_deref() == Some(code) && (constraint.is_none() || db.constraint() == constraint)
}

fn to_u64(column: &str, value: i64) -> Result<u64, PurseError> {
    u64::try_from(value)
        .map_err(|_| PurseError::Persistence(format!("negative {}: {}", column, value)))
}

fn to_i64(value: u64) -> Result<i64, PurseError> {
    i64::try_from(value)
        .map_err(|_| PurseError::InvalidRequest(format!("amount out of range: {}", value)))
}

fn row_to_balance(row: &PgRow) -> Result<Balance, PurseError> {
    Ok(Balance {
        user_id: row.try_get("user_id")?,
        total_balance: to_u64("total_balance", row.try_get("total_balance")?)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction, PurseError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let item_id: String = row.try_get("item_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse()?,
        amount: to_u64("amount", row.try_get("amount")?)?,
        status: status.parse()?,
        balance_before: to_u64("balance_before", row.try_get("balance_before")?)?,
        balance_after: to_u64("balance_after", row.try_get("balance_after")?)?,
        item_id: ItemId::parse(&item_id)?,
        idempotency_hash: row.try_get("idempotency_hash")?,
        created_at,
    })
}

#[async_trait::async_trait]
impl BalanceStore for PostgresAdapter {
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>, PurseError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, total_balance, updated_at
            FROM purse_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_balance).transpose()
    }

    async fn compare_and_set(
        &self,
        user_id: Uuid,
        expected: u64,
        new_value: u64,
    ) -> Result<CasOutcome, PurseError> {
        let updated = sqlx::query(
            r#"
            UPDATE purse_balances
            SET total_balance = $3, updated_at = $4
            WHERE user_id = $1 AND total_balance = $2
            "#,
        )
        .bind(user_id)
        .bind(to_i64(expected)?)
        .bind(to_i64(new_value)?)
        .bind(now())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM purse_balances WHERE user_id = $1)")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(if exists {
            CasOutcome::Conflict
        } else {
            CasOutcome::NotFound
        })
    }

    async fn open_balance(&self, user_id: Uuid, initial: u64) -> Result<Balance, PurseError> {
        let row = sqlx::query(
            r#"
            INSERT INTO purse_balances (user_id, total_balance, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING user_id, total_balance, updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_i64(initial)?)
        .bind(now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PurseError::BalanceExists)?;

        row_to_balance(&row)
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresAdapter {
    async fn append(&self, record: &Transaction) -> Result<(), PurseError> {
        let amounts = EncodedAmounts::of(record)?;
        match Self::insert_transaction(&self.pool, record, &amounts).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.insert_error(err, record).await),
        }
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Transaction, PurseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM purse_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PurseError::TransactionNotFound(id))?;

        row_to_transaction(&row)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Transaction>, PurseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match after {
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM purse_transactions
                    WHERE user_id = $1
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    "#,
                    TRANSACTION_COLUMNS
                ))
                .bind(user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                let cursor_at: DateTime<Utc> = sqlx::query_scalar(
                    "SELECT created_at FROM purse_transactions WHERE id = $1 AND user_id = $2",
                )
                .bind(cursor)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(PurseError::TransactionNotFound(cursor))?;

                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM purse_transactions
                    WHERE user_id = $1 AND (created_at, id) > ($2, $3)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $4
                    "#,
                    TRANSACTION_COLUMNS
                ))
                .bind(user_id)
                .bind(cursor_at)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_transaction).collect()
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_hash: &str,
    ) -> Result<Option<Transaction>, PurseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM purse_transactions WHERE idempotency_hash = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(idempotency_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transaction).transpose()
    }
}

#[async_trait::async_trait]
impl PurseAdapter for PostgresAdapter {
    async fn execute_purchase(&self, plan: &PurchasePlan) -> Result<CasOutcome, PurseError> {
        let record = &plan.record;
        let amounts = EncodedAmounts::of(record)?;
        let expected = to_i64(plan.expected_current)?;
        let new_value = to_i64(plan.new_value())?;
        let updated_at = now().max(record.created_at);

        let mut tx = self.pool.begin().await?;

        // ── Ledger first ──────────────────────────────────────────────────────
        if let Err(err) = Self::insert_transaction(&mut *tx, record, &amounts).await {
            tx.rollback().await.ok();
            if violates(&err, FOREIGN_KEY_VIOLATION, None) {
                return Ok(CasOutcome::NotFound);
            }
            return Err(self.insert_error(err, record).await);
        }

        // ── Balance compare-and-set ───────────────────────────────────────────
        // A concurrent writer holding the row makes this wait, then re-check
        // the predicate against the committed value.
        let updated = sqlx::query(
            r#"
            UPDATE purse_balances
            SET total_balance = $3, updated_at = $4
            WHERE user_id = $1 AND total_balance = $2
            "#,
        )
        .bind(record.user_id)
        .bind(expected)
        .bind(new_value)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM purse_balances WHERE user_id = $1)",
            )
            .bind(record.user_id)
            .fetch_one(&mut *tx)
            .await?;

            // Drops the ledger row written above.
            tx.rollback().await?;
            return Ok(if exists {
                CasOutcome::Conflict
            } else {
                CasOutcome::NotFound
            });
        }

        tx.commit().await?;
        Ok(CasOutcome::Applied)
    }
}
