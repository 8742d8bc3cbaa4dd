//! Account Ledger persistence. A `sqlx::PgPool` is the production
//! backend; an in-memory map stands in when `DATABASE_URL` is unset,
//! which keeps Cashu-only deployments and unit tests free of a live
//! Postgres dependency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::ProxyError;

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub hashed_key: String,
    pub balance: i64,
    pub refund_address: Option<String>,
    pub key_expiry_time: Option<i64>,
    pub total_spent: i64,
    pub total_requests: i64,
}

#[async_trait]
pub trait AccountLedger: Send + Sync {
    /// Atomically check `balance >= max_cost_for_model`, debit it, and
    /// increment `total_requests` — all inside one transaction.
    async fn pre_charge(&self, hashed_key: &str, max_cost_msat: u64) -> Result<i64, ProxyError>;

    /// Credit back `pre_auth - final_cost` (clamped at zero) and record
    /// `total_spent += final_cost`.
    async fn settle(&self, hashed_key: &str, pre_auth_msat: u64, final_msat: u64) -> Result<(), ProxyError>;

    async fn balance(&self, hashed_key: &str) -> Result<Option<i64>, ProxyError>;
}

pub async fn init_pool(database_url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    match database_url {
        Some(url) if !url.is_empty() => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            Ok(Some(pool))
        }
        _ => Ok(None),
    }
}

pub struct PgAccountLedger {
    pool: PgPool,
}

impl PgAccountLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountLedger for PgAccountLedger {
    async fn pre_charge(&self, hashed_key: &str, max_cost_msat: u64) -> Result<i64, ProxyError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT balance FROM api_keys WHERE hashed_key = $1 FOR UPDATE",
        )
        .bind(hashed_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        let balance = match row {
            Some((balance,)) => balance,
            None => return Err(ProxyError::Unauthorized),
        };

        if balance < max_cost_msat as i64 {
            return Err(ProxyError::InsufficientBalance {
                amount_required_msat: max_cost_msat,
                model: None,
                cashu_rail: false,
            });
        }

        sqlx::query(
            "UPDATE api_keys SET balance = balance - $1, total_requests = total_requests + 1 WHERE hashed_key = $2",
        )
        .bind(max_cost_msat as i64)
        .bind(hashed_key)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        tx.commit().await.map_err(anyhow::Error::from)?;
        Ok(balance - max_cost_msat as i64)
    }

    async fn settle(&self, hashed_key: &str, pre_auth_msat: u64, final_msat: u64) -> Result<(), ProxyError> {
        let refund = pre_auth_msat.saturating_sub(final_msat) as i64;
        sqlx::query(
            "UPDATE api_keys SET balance = balance + $1, total_spent = total_spent + $2 WHERE hashed_key = $3",
        )
        .bind(refund)
        .bind(final_msat as i64)
        .bind(hashed_key)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn balance(&self, hashed_key: &str) -> Result<Option<i64>, ProxyError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM api_keys WHERE hashed_key = $1")
            .bind(hashed_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(row.map(|(b,)| b))
    }
}

/// Single-writer-per-row in-memory ledger, guarded by one mutex over the
/// whole map — adequate for the test/dev deployment mode this backs.
#[derive(Default)]
pub struct InMemoryAccountLedger {
    rows: Mutex<HashMap<String, ApiKeyRow>>,
}

impl InMemoryAccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, hashed_key: impl Into<String>, balance_msat: i64) {
        let hashed_key = hashed_key.into();
        let mut rows = self.rows.lock().await;
        rows.insert(
            hashed_key.clone(),
            ApiKeyRow {
                hashed_key,
                balance: balance_msat,
                ..Default::default()
            },
        );
    }
}

#[async_trait]
impl AccountLedger for InMemoryAccountLedger {
    async fn pre_charge(&self, hashed_key: &str, max_cost_msat: u64) -> Result<i64, ProxyError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(hashed_key).ok_or(ProxyError::Unauthorized)?;
        if row.balance < max_cost_msat as i64 {
            return Err(ProxyError::InsufficientBalance {
                amount_required_msat: max_cost_msat,
                model: None,
                cashu_rail: false,
            });
        }
        row.balance -= max_cost_msat as i64;
        row.total_requests += 1;
        Ok(row.balance)
    }

    async fn settle(&self, hashed_key: &str, pre_auth_msat: u64, final_msat: u64) -> Result<(), ProxyError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(hashed_key) {
            let refund = pre_auth_msat.saturating_sub(final_msat) as i64;
            row.balance += refund;
            row.total_spent += final_msat as i64;
        }
        Ok(())
    }

    async fn balance(&self, hashed_key: &str) -> Result<Option<i64>, ProxyError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(hashed_key).map(|r| r.balance))
    }
}

pub fn ledger_from_pool(pool: Option<PgPool>) -> Arc<dyn AccountLedger> {
    match pool {
        Some(pool) => Arc::new(PgAccountLedger::new(pool)),
        None => Arc::new(InMemoryAccountLedger::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pre_charge_debits_and_settle_refunds_surplus() {
        let ledger = InMemoryAccountLedger::new();
        ledger.seed("abc", 5000).await;

        let remaining = ledger.pre_charge("abc", 1000).await.unwrap();
        assert_eq!(remaining, 4000);

        ledger.settle("abc", 1000, 400).await.unwrap();
        assert_eq!(ledger.balance("abc").await.unwrap(), Some(4600));
    }

    #[tokio::test]
    async fn pre_charge_rejects_insufficient_balance() {
        let ledger = InMemoryAccountLedger::new();
        ledger.seed("abc", 100).await;

        let err = ledger.pre_charge("abc", 1000).await.unwrap_err();
        assert!(matches!(err, ProxyError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance("abc").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn settle_never_drives_balance_negative_from_clamp() {
        let ledger = InMemoryAccountLedger::new();
        ledger.seed("abc", 5000).await;
        ledger.pre_charge("abc", 1000).await.unwrap();
        // final cost exceeds pre_auth: refund clamps at zero via saturating_sub
        ledger.settle("abc", 1000, 5000).await.unwrap();
        assert_eq!(ledger.balance("abc").await.unwrap(), Some(4000));
    }

    #[tokio::test]
    async fn unknown_key_is_unauthorized() {
        let ledger = InMemoryAccountLedger::new();
        let err = ledger.pre_charge("missing", 1000).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized));
    }
}
