//! Database operations and connection management
//!
//! Owns the Postgres connection pool shared by every worker and persists
//! computed charges against call records. The pool is the one resource all
//! workers use concurrently; sqlx handles the synchronization.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    config::DatabaseConfig,
    error::{AppError, AppResult},
    models::BalanceResponse,
};

/// Persists billing results. Implementations must be safe for concurrent use.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Writes the charge for the call identified by `response.call_id`
    async fn update_call_info(&self, response: &BalanceResponse) -> AppResult<()>;
}

/// Main database service with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to Postgres with the configured pool settings
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(config.conn_lifetime())
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;

        info!(
            "Connected to database with {} max connections",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Runs pending database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Verifies database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Returns the underlying connection pool
    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for Database {
    async fn update_call_info(&self, response: &BalanceResponse) -> AppResult<()> {
        let result = sqlx::query("UPDATE call_info SET billing_cost = $1 WHERE call_id = $2")
            .bind(response.charge_amount)
            .bind(&response.call_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                warn!(call_id = %response.call_id, "Unable to update billing info: {}", e);
                AppError::Database(e)
            })?;

        // A missing call record is not retryable; the message is still acknowledged
        if result.rows_affected() == 0 {
            warn!(
                call_id = %response.call_id,
                charge_amount = %response.charge_amount,
                "No call record to update billing info"
            );
        }

        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStore;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use super::*;
    use rust_decimal::Decimal;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    /// In-memory store recording every charge, with injectable failures
    #[derive(Default)]
    pub struct MemoryStore {
        charges: Mutex<HashMap<String, Decimal>>,
        failing_calls: Mutex<HashSet<String>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every update for `call_id` fail
        pub async fn fail_call(&self, call_id: &str) {
            self.failing_calls.lock().await.insert(call_id.to_string());
        }

        pub async fn charge_for(&self, call_id: &str) -> Option<Decimal> {
            self.charges.lock().await.get(call_id).copied()
        }

        pub async fn len(&self) -> usize {
            self.charges.lock().await.len()
        }
    }

    #[async_trait]
    impl BillingStore for MemoryStore {
        async fn update_call_info(&self, response: &BalanceResponse) -> AppResult<()> {
            if self.failing_calls.lock().await.contains(&response.call_id) {
                return Err(crate::internal_error!(format!(
                    "injected store failure for {}",
                    response.call_id
                )));
            }
            self.charges
                .lock()
                .await
                .insert(response.call_id.clone(), response.charge_amount);
            Ok(())
        }
    }
}
