//! Persistence for tickets, the order read model and key/value settings.
//!
//! Every consumer depends on the store traits below. Postgres repositories back
//! them in production; [`memory`] backs them in tests and in `SKIP_EXTERNALS` mode.

pub mod error;
pub mod memory;
#[cfg(feature = "database")]
pub mod order_repository;
#[cfg(feature = "database")]
pub mod settings_repository;
#[cfg(feature = "database")]
pub mod ticket_repository;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use self::error::DatabaseError;
use crate::orders::Order;
use crate::tickets::{NewTicket, OrderId, SyncRecord, Ticket, TicketId};

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persist a new ticket. Returns `None` when the order already owns a ticket.
    async fn insert(&self, ticket: NewTicket) -> Result<Option<Ticket>, DatabaseError>;

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, DatabaseError>;

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Ticket>, DatabaseError>;

    async fn code_exists(&self, code: &str) -> Result<bool, DatabaseError>;

    async fn find_by_recovery_token(&self, token: &str) -> Result<Option<Ticket>, DatabaseError>;

    /// Tickets owned by a customer account, newest first.
    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Ticket>, DatabaseError>;

    async fn set_qr_ref(&self, id: TicketId, qr_ref: &str) -> Result<(), DatabaseError>;

    async fn record_sync(&self, id: TicketId, record: &SyncRecord) -> Result<(), DatabaseError>;

    async fn set_recovery(
        &self,
        id: TicketId,
        token: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError>;

    /// Flip up to `limit` active tickets with `valid_to < now` to expired.
    async fn expire_overdue(&self, now: i64, limit: i64) -> Result<Vec<TicketId>, DatabaseError>;

    /// Failed syncs with fewer than `max_attempts` provider attempts.
    async fn find_retryable(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<TicketId>, DatabaseError>;

    /// Take one email send slot. `None` once the ticket has used `limit` sends.
    /// Returns the new send count.
    async fn reserve_email_send(
        &self,
        id: TicketId,
        limit: i32,
    ) -> Result<Option<i32>, DatabaseError>;

    /// Hand back a slot taken by [`TicketStore::reserve_email_send`].
    async fn release_email_send(&self, id: TicketId) -> Result<(), DatabaseError>;

    /// Store `email` as the ticket's address when it has none.
    async fn record_email_recipient(&self, id: TicketId, email: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: OrderId) -> Result<Option<Order>, DatabaseError>;

    /// Store the issued ticket id on the order. Linking the same ticket twice is
    /// a no-op; linking a different one is a unique violation.
    async fn link_ticket(&self, id: OrderId, ticket_id: TicketId) -> Result<(), DatabaseError>;

    async fn set_billing_email(&self, id: OrderId, email: &str) -> Result<(), DatabaseError>;

    /// Append to the order's operator-visible note log.
    async fn add_note(&self, id: OrderId, note: &str) -> Result<(), DatabaseError>;

    async fn customer_email(&self, customer_id: i64) -> Result<Option<String>, DatabaseError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, DatabaseError>;

    async fn set(&self, key: &str, value: JsonValue) -> Result<(), DatabaseError>;

    async fn delete(&self, key: &str) -> Result<(), DatabaseError>;
}

#[cfg(feature = "database")]
pub use pool::{health_check, init_pool, init_pool_from_config, PoolConfig};

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info, warn};

    use super::error::{DatabaseError, DatabaseErrorKind};
    use crate::config::DatabaseConfig;

    /// Database pool configuration
    #[derive(Debug, Clone)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 20,
                min_connections: 2,
                connection_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    /// Initialize the database connection pool and apply pending migrations
    pub async fn init_pool(
        database_url: &str,
        config: Option<PoolConfig>,
    ) -> Result<PgPool, DatabaseError> {
        let config = config.unwrap_or_default();

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connection_timeout = ?config.connection_timeout,
            "Initializing database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!("Failed to initialize database pool: {}", e);
                DatabaseError::from_sqlx(e)
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                log_error!("Failed to apply migrations: {}", e);
                DatabaseError::new(DatabaseErrorKind::Query, e.to_string())
            })?;

        info!("Database pool initialized successfully");
        Ok(pool)
    }

    /// Connection pool health check
    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
            warn!("Health check failed: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

        Ok(())
    }

    /// Initialize the database pool from application configuration
    pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        if config.url.is_empty() {
            return Err(DatabaseError::new(
                DatabaseErrorKind::Connection,
                "DATABASE_URL not set",
            ));
        }

        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connection_timeout: Duration::from_secs(config.connection_timeout),
            idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
            max_lifetime: Duration::from_secs(1800),
        };

        init_pool(&config.url, Some(pool_config)).await
    }

}
