//! PostgreSQL implementation for history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::database::Result;
use crate::history::{Entry, HistoryStore, HistoryTransaction, NewEntry};

const COLUMNS: &str = "id, user_id, ip, city, region, country, loc, hostname, org, postal, timezone, created_at";

/// PostgreSQL history store.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    /// Create a new [`PgHistoryStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn begin(&self, user_id: Uuid) -> Result<Box<dyn HistoryTransaction>> {
        let mut tx = self.pool.begin().await?;

        // Serialize writers of the same user until commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgHistoryTransaction { tx }))
    }

    async fn list(&self, user_id: Uuid, limit: Option<i64>) -> Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            r#"SELECT {COLUMNS} FROM history
                WHERE user_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2"#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn delete_by_user_and_ips(
        &self,
        user_id: Uuid,
        ips: &[String],
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM history WHERE user_id = $1 AND ip = ANY($2)")
                .bind(user_id)
                .bind(ips)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Transaction holding the per-user advisory lock.
///
/// Dropped without commit, sqlx rolls it back.
struct PgHistoryTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl HistoryTransaction for PgHistoryTransaction {
    async fn find_one(&mut self, user_id: Uuid, ip: &str) -> Result<Option<Entry>> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {COLUMNS} FROM history WHERE user_id = $1 AND ip = $2"
        ))
        .bind(user_id)
        .bind(ip)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    async fn insert(
        &mut self,
        user_id: Uuid,
        entry: &NewEntry,
        created_at: DateTime<Utc>,
    ) -> Result<Entry> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            r#"INSERT INTO history (user_id, ip, city, region, country, loc, hostname, org, postal, timezone, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING {COLUMNS}"#
        ))
        .bind(user_id)
        .bind(&entry.ip)
        .bind(&entry.city)
        .bind(&entry.region)
        .bind(&entry.country)
        .bind(&entry.loc)
        .bind(&entry.hostname)
        .bind(&entry.org)
        .bind(&entry.postal)
        .bind(&entry.timezone)
        .bind(created_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    async fn update_recency(&mut self, id: i64, now: DateTime<Utc>) -> Result<Entry> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "UPDATE history SET created_at = $2 WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    async fn list(&mut self, user_id: Uuid) -> Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            r#"SELECT {COLUMNS} FROM history
                WHERE user_id = $1
                ORDER BY created_at DESC, id DESC"#
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(entries)
    }

    async fn delete_by_ids(&mut self, ids: &[i64]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
