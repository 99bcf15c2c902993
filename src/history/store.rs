//! Persistence ports used by [`HistoryService`](super::HistoryService).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::database::Result;
use crate::history::{Entry, NewEntry};

/// Port for connection history persistence.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Open a unit of work on the history of `user_id`.
    ///
    /// Units of work opened for the same user never interleave: the second
    /// one waits until the first is committed or dropped.
    async fn begin(&self, user_id: Uuid) -> Result<Box<dyn HistoryTransaction>>;

    /// Entries of a user, most recent first, optionally limited.
    async fn list(&self, user_id: Uuid, limit: Option<i64>) -> Result<Vec<Entry>>;

    /// Delete entries of a user whose IP is in `ips`. Returns deleted rows.
    async fn delete_by_user_and_ips(
        &self,
        user_id: Uuid,
        ips: &[String],
    ) -> Result<u64>;

    /// Delete every entry of a user. Returns deleted rows.
    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64>;
}

/// Atomic unit of work on one user's history.
///
/// Nothing is visible to other callers before [`commit`](Self::commit);
/// dropping the transaction discards every change.
#[async_trait]
pub trait HistoryTransaction: Send {
    /// Find the entry identified by its natural key.
    async fn find_one(&mut self, user_id: Uuid, ip: &str) -> Result<Option<Entry>>;

    /// Insert a new entry. Fails with `DuplicateKey` if `(user_id, ip)` exists
    /// and `ForeignKey` if the user does not.
    async fn insert(
        &mut self,
        user_id: Uuid,
        entry: &NewEntry,
        created_at: DateTime<Utc>,
    ) -> Result<Entry>;

    /// Move the recency timestamp of an entry, leaving other fields intact.
    async fn update_recency(&mut self, id: i64, now: DateTime<Utc>) -> Result<Entry>;

    /// Every entry of a user, most recent first.
    async fn list(&mut self, user_id: Uuid) -> Result<Vec<Entry>>;

    async fn delete_by_ids(&mut self, ids: &[i64]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
