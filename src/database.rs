//! database (db) connection and store-level errors.
pub mod memory;

use sqlx::PgPool;
use sqlx::error::ErrorKind;
use sqlx::postgres::PgPoolOptions;

pub use memory::MemoryStore;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "lastseen";
pub const DEFAULT_POOL_SIZE: u32 = 10;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures reported by a store, normalised across backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row already exists for this unique key")]
    DuplicateKey,
    #[error("referenced user does not exist")]
    ForeignKey,
    #[error("history would exceed its per-user cap")]
    CapExceeded,
    #[error("store operation timed out")]
    Timeout,
    #[error("SQL request failed: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::PoolTimedOut = err {
            return StoreError::Timeout;
        }

        match err.as_database_error().map(|e| e.kind()) {
            Some(ErrorKind::UniqueViolation) => StoreError::DuplicateKey,
            Some(ErrorKind::ForeignKeyViolation) => StoreError::ForeignKey,
            Some(ErrorKind::CheckViolation) => StoreError::CapExceeded,
            _ => StoreError::Database(err),
        }
    }
}

/// PostgreSQL connection pool, opened at startup and closed at shutdown.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    /// Connect using the `postgres` configuration section, with defaults for
    /// missing credentials.
    pub async fn from_config(
        config: &crate::config::Postgres,
    ) -> std::result::Result<Self, sqlx::Error> {
        Self::new(
            &config.address,
            config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
            config.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        )
        .await
    }

    /// Execute pending migration scripts.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.postgres).await
    }

    /// Wait for in-flight queries then close every connection.
    pub async fn close(&self) {
        self.postgres.close().await;
        tracing::info!("postgres connections closed");
    }
}
