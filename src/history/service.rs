//! Connection history manager.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::database::StoreError;
use crate::history::error::{HistoryError, Result, empty_ips};
use crate::history::{DEFAULT_LIMIT, Entry, HistoryStore, MAX_ENTRIES, NewEntry};

/// Sole writer of users' connection history.
///
/// Holds no state between calls: everything lives in the [`HistoryStore`].
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl HistoryService {
    /// Create a new [`HistoryService`].
    pub fn new(
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Same service, bounded by another deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Record that `user_id` was seen from `entry.ip`.
    ///
    /// A known IP only gets its recency refreshed; the other attributes keep
    /// their first reported values. A new IP is inserted, then entries beyond
    /// [`MAX_ENTRIES`] are evicted, oldest first.
    #[tracing::instrument(skip(self, entry), fields(ip = %entry.ip))]
    pub async fn upsert(&self, user_id: Uuid, entry: NewEntry) -> Result<Entry> {
        entry.validate()?;

        // One deadline for the first attempt and its retry.
        let deadline = Instant::now() + self.timeout;
        let result = match self.try_upsert(user_id, &entry, deadline).await {
            // Another writer inserted the same IP first: it now exists, so
            // retrying takes the refresh path.
            Err(StoreError::DuplicateKey) => {
                tracing::debug!(%user_id, "concurrent insert of same ip, retrying");
                self.try_upsert(user_id, &entry, deadline).await
            },
            result => result,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(StoreError::ForeignKey) => "unknown_user",
            Err(_) => "error",
        };
        metrics::counter!("history_upserts_total", "outcome" => outcome).increment(1);

        result.map_err(HistoryError::from)
    }

    async fn try_upsert(
        &self,
        user_id: Uuid,
        entry: &NewEntry,
        deadline: Instant,
    ) -> std::result::Result<Entry, StoreError> {
        Self::deadline_at(deadline, async {
            let mut tx = self.store.begin(user_id).await?;
            let now = self.clock.now();

            if let Some(existing) = tx.find_one(user_id, &entry.ip).await? {
                let refreshed = tx.update_recency(existing.id, now).await?;
                tx.commit().await?;
                return Ok(refreshed);
            }

            let inserted = tx.insert(user_id, entry, now).await?;

            let excess: Vec<i64> = tx
                .list(user_id)
                .await?
                .iter()
                .skip(MAX_ENTRIES)
                .map(|e| e.id)
                .collect();
            if !excess.is_empty() {
                let evicted = tx.delete_by_ids(&excess).await?;
                tracing::debug!(%user_id, evicted, "history cap reached");
                metrics::counter!("history_evictions_total").increment(evicted);
            }

            tx.commit().await?;
            Ok(inserted)
        })
        .await
    }

    /// Up to `limit` entries of `user_id`, most recent first.
    ///
    /// A missing or non-positive `limit` falls back to [`DEFAULT_LIMIT`].
    pub async fn list(&self, user_id: Uuid, limit: Option<i64>) -> Result<Vec<Entry>> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIMIT);

        Ok(self
            .deadline(self.store.list(user_id, Some(limit)))
            .await?)
    }

    /// Delete entries of `user_id` whose IP is in `ips`. Unknown IPs are
    /// ignored.
    pub async fn delete_by_ips(&self, user_id: Uuid, ips: &[String]) -> Result<u64> {
        if ips.is_empty() {
            return Err(empty_ips().into());
        }

        let deleted = self
            .deadline(self.store.delete_by_user_and_ips(user_id, ips))
            .await?;
        tracing::debug!(%user_id, deleted, "history entries deleted");

        Ok(deleted)
    }

    /// Delete every entry of `user_id`.
    pub async fn delete_all(&self, user_id: Uuid) -> Result<()> {
        let deleted = self.deadline(self.store.delete_by_user(user_id)).await?;
        tracing::debug!(%user_id, deleted, "history cleared");

        Ok(())
    }

    /// Run `fut` under the service deadline.
    async fn deadline<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        Self::deadline_at(Instant::now() + self.timeout, fut).await
    }

    /// Run `fut` until `deadline`. On expiry `fut` is dropped, which rolls
    /// back any transaction it holds.
    async fn deadline_at<T>(
        deadline: Instant,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::clock::SteppingClock;
    use crate::database::MemoryStore;
    use crate::history::HistoryTransaction;
    use crate::user::UserRepository;

    async fn setup() -> (HistoryService, MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let user = store
            .insert("admin@example.com", "hash", "Admin User")
            .await
            .unwrap();
        let service = HistoryService::new(
            Arc::new(store.clone()),
            Arc::new(SteppingClock::default()),
            Duration::from_secs(5),
        );

        (service, store, user.id)
    }

    fn ips(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.ip.as_str()).collect()
    }

    #[tokio::test]
    async fn test_refresh_keeps_first_attributes() {
        let (history, _, user) = setup().await;

        assert!(history.list(user, None).await.unwrap().is_empty());

        let first = history
            .upsert(user, NewEntry::new("1.1.1.1").city("A"))
            .await
            .unwrap();
        assert_eq!(first.city.as_deref(), Some("A"));

        let second = history
            .upsert(user, NewEntry::new("1.1.1.1").city("B").country("FR"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.city.as_deref(), Some("A"));
        assert_eq!(second.country, None);
        // Exactly the second read of the clock.
        assert_eq!(
            second.created_at,
            first.created_at + chrono::Duration::milliseconds(1)
        );

        let entries = history.list(user, Some(10)).await.unwrap();
        assert_eq!(entries, vec![second]);
    }

    #[tokio::test]
    async fn test_cap_never_exceeded() {
        let (history, _, user) = setup().await;

        for i in 0..25 {
            history
                .upsert(user, NewEntry::new(format!("10.0.0.{i}")))
                .await
                .unwrap();
            let stored = history.list(user, Some(100)).await.unwrap();
            assert!(stored.len() <= MAX_ENTRIES);
        }
    }

    #[tokio::test]
    async fn test_eleventh_ip_evicts_oldest() {
        let (history, _, user) = setup().await;

        for i in 1..=11 {
            let inserted = history
                .upsert(user, NewEntry::new(format!("10.0.0.{i}")))
                .await
                .unwrap();
            assert_eq!(inserted.ip, format!("10.0.0.{i}"));
        }

        let entries = history.list(user, Some(100)).await.unwrap();
        let expected: Vec<String> =
            (2..=11).rev().map(|i| format!("10.0.0.{i}")).collect();
        assert_eq!(ips(&entries), expected);
    }

    #[tokio::test]
    async fn test_refreshed_entry_survives_eviction() {
        let (history, _, user) = setup().await;

        for i in 1..=10 {
            history
                .upsert(user, NewEntry::new(format!("10.0.0.{i}")))
                .await
                .unwrap();
        }
        // Oldest entry becomes the most recent.
        history.upsert(user, NewEntry::new("10.0.0.1")).await.unwrap();
        history.upsert(user, NewEntry::new("10.0.0.11")).await.unwrap();

        let entries = history.list(user, Some(100)).await.unwrap();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(ips(&entries)[..2], ["10.0.0.11", "10.0.0.1"]);
        assert!(!ips(&entries).contains(&"10.0.0.2"));
    }

    #[tokio::test]
    async fn test_list_order_and_limit() {
        let (history, _, user) = setup().await;

        for ip in ["a", "b", "c", "b"] {
            history.upsert(user, NewEntry::new(ip)).await.unwrap();
        }

        let entries = history.list(user, Some(10)).await.unwrap();
        assert_eq!(ips(&entries), ["b", "c", "a"]);
        assert!(entries.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        assert_eq!(history.list(user, Some(2)).await.unwrap().len(), 2);
        assert_eq!(history.list(user, Some(0)).await.unwrap().len(), 3);
        assert_eq!(history.list(user, Some(-4)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_default_limit() {
        let (history, _, user) = setup().await;

        for i in 0..12 {
            history
                .upsert(user, NewEntry::new(format!("10.0.0.{i}")))
                .await
                .unwrap();
        }

        assert_eq!(
            history.list(user, None).await.unwrap().len(),
            DEFAULT_LIMIT as usize
        );
    }

    #[tokio::test]
    async fn test_validation() {
        let (history, _, user) = setup().await;

        assert!(matches!(
            history.upsert(user, NewEntry::new("")).await,
            Err(HistoryError::Validation(_))
        ));
        assert!(matches!(
            history.delete_by_ips(user, &[]).await,
            Err(HistoryError::Validation(_))
        ));
        assert!(history.list(user, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (history, _, _) = setup().await;

        assert!(matches!(
            history.upsert(Uuid::new_v4(), NewEntry::new("1.1.1.1")).await,
            Err(HistoryError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_by_ips() {
        let (history, _, user) = setup().await;
        for ip in ["a", "b", "c"] {
            history.upsert(user, NewEntry::new(ip)).await.unwrap();
        }

        let deleted = history
            .delete_by_ips(user, &["a".to_owned(), "c".to_owned()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(ips(&history.list(user, None).await.unwrap()), ["b"]);

        // Absent IPs are not an error and change nothing.
        let deleted = history
            .delete_by_ips(user, &["203.0.113.9".to_owned()])
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(ips(&history.list(user, None).await.unwrap()), ["b"]);
    }

    #[tokio::test]
    async fn test_delete_scoped_to_user() {
        let (history, store, user) = setup().await;
        let other = store
            .insert("other@example.com", "hash", "Other")
            .await
            .unwrap()
            .id;

        history.upsert(user, NewEntry::new("a")).await.unwrap();
        history.upsert(other, NewEntry::new("a")).await.unwrap();

        history.delete_by_ips(user, &["a".to_owned()]).await.unwrap();
        assert_eq!(history.list(other, None).await.unwrap().len(), 1);

        history.delete_all(other).await.unwrap();
        assert!(history.list(other, None).await.unwrap().is_empty());

        // Already empty.
        history.delete_all(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_ip() {
        let (history, _, user) = setup().await;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let history = history.clone();
                tokio::spawn(async move {
                    history.upsert(user, NewEntry::new("192.0.2.1")).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(history.list(user, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_distinct_ips() {
        let (history, _, user) = setup().await;

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let history = history.clone();
                tokio::spawn(async move {
                    history.upsert(user, NewEntry::new(format!("10.1.0.{i}"))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(history.list(user, Some(100)).await.unwrap().len(), MAX_ENTRIES);
    }

    /// Store losing the race on the first `conflicts` units of work: their
    /// snapshot misses the rival row, and their insert collides with it.
    struct RacingStore {
        inner: MemoryStore,
        conflicts: AtomicUsize,
        raced: Arc<AtomicUsize>,
        /// Delay before each unit of work starts.
        latency: Duration,
    }

    struct RacingTransaction {
        /// `None` when this unit of work loses the race.
        inner: Option<Box<dyn HistoryTransaction>>,
        store: MemoryStore,
    }

    impl RacingTransaction {
        fn winner(&mut self) -> &mut Box<dyn HistoryTransaction> {
            self.inner
                .as_mut()
                .expect("a conflicting unit of work stops at insert")
        }
    }

    #[async_trait]
    impl HistoryStore for RacingStore {
        async fn begin(
            &self,
            user_id: Uuid,
        ) -> crate::database::Result<Box<dyn HistoryTransaction>> {
            tokio::time::sleep(self.latency).await;
            let conflict = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            let inner = if conflict {
                self.raced.fetch_add(1, Ordering::SeqCst);
                None
            } else {
                Some(self.inner.begin(user_id).await?)
            };

            Ok(Box::new(RacingTransaction {
                inner,
                store: self.inner.clone(),
            }))
        }

        async fn list(
            &self,
            user_id: Uuid,
            limit: Option<i64>,
        ) -> crate::database::Result<Vec<Entry>> {
            self.inner.list(user_id, limit).await
        }

        async fn delete_by_user_and_ips(
            &self,
            user_id: Uuid,
            ips: &[String],
        ) -> crate::database::Result<u64> {
            self.inner.delete_by_user_and_ips(user_id, ips).await
        }

        async fn delete_by_user(&self, user_id: Uuid) -> crate::database::Result<u64> {
            self.inner.delete_by_user(user_id).await
        }
    }

    #[async_trait]
    impl HistoryTransaction for RacingTransaction {
        async fn find_one(
            &mut self,
            user_id: Uuid,
            ip: &str,
        ) -> crate::database::Result<Option<Entry>> {
            match self.inner.as_mut() {
                Some(tx) => tx.find_one(user_id, ip).await,
                None => Ok(None),
            }
        }

        async fn insert(
            &mut self,
            user_id: Uuid,
            entry: &NewEntry,
            created_at: DateTime<Utc>,
        ) -> crate::database::Result<Entry> {
            if let Some(tx) = self.inner.as_mut() {
                return tx.insert(user_id, entry, created_at).await;
            }

            // The rival commits the same key first.
            let mut rival = self.store.begin(user_id).await?;
            if rival.find_one(user_id, &entry.ip).await?.is_none() {
                rival.insert(user_id, entry, created_at).await?;
                rival.commit().await?;
            }

            Err(StoreError::DuplicateKey)
        }

        async fn update_recency(
            &mut self,
            id: i64,
            now: DateTime<Utc>,
        ) -> crate::database::Result<Entry> {
            self.winner().update_recency(id, now).await
        }

        async fn list(&mut self, user_id: Uuid) -> crate::database::Result<Vec<Entry>> {
            self.winner().list(user_id).await
        }

        async fn delete_by_ids(&mut self, ids: &[i64]) -> crate::database::Result<u64> {
            self.winner().delete_by_ids(ids).await
        }

        async fn commit(self: Box<Self>) -> crate::database::Result<()> {
            match self.inner {
                Some(tx) => tx.commit().await,
                None => Ok(()),
            }
        }
    }

    async fn racing_setup(conflicts: usize) -> (HistoryService, Arc<AtomicUsize>, Uuid) {
        racing_setup_with_latency(conflicts, Duration::ZERO).await
    }

    async fn racing_setup_with_latency(
        conflicts: usize,
        latency: Duration,
    ) -> (HistoryService, Arc<AtomicUsize>, Uuid) {
        let store = MemoryStore::new();
        let user = store.insert("admin@example.com", "hash", "Admin").await.unwrap();
        let raced = Arc::new(AtomicUsize::new(0));
        let service = HistoryService::new(
            Arc::new(RacingStore {
                inner: store,
                conflicts: AtomicUsize::new(conflicts),
                raced: Arc::clone(&raced),
                latency,
            }),
            Arc::new(SteppingClock::default()),
            Duration::from_secs(5),
        );

        (service, raced, user.id)
    }

    #[tokio::test]
    async fn test_duplicate_key_retried_as_refresh() {
        let (history, raced, user) = racing_setup(1).await;

        let entry = history
            .upsert(user, NewEntry::new("1.1.1.1").city("A"))
            .await
            .unwrap();

        assert_eq!(raced.load(Ordering::SeqCst), 1);
        assert_eq!(entry.ip, "1.1.1.1");
        assert_eq!(history.list(user, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_duplicate_key_escalates() {
        let (history, raced, user) = racing_setup(2).await;

        // The retry loses the race too.
        let first = history.upsert(user, NewEntry::new("1.1.1.1")).await;
        assert!(matches!(
            first,
            Err(HistoryError::Storage(StoreError::DuplicateKey))
        ));
        assert_eq!(raced.load(Ordering::SeqCst), 2);

        // The rival's row is intact and unique.
        assert_eq!(history.list(user, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_shares_the_deadline() {
        // Each attempt fits the deadline, both together do not.
        let (history, raced, user) =
            racing_setup_with_latency(1, Duration::from_millis(40)).await;
        let history = history.with_timeout(Duration::from_millis(60));

        let result = history.upsert(user, NewEntry::new("1.1.1.1")).await;

        assert_eq!(raced.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(HistoryError::Storage(StoreError::Timeout))
        ));
    }

    /// Store whose units of work never finish inserting.
    struct StallingStore {
        inner: MemoryStore,
    }

    struct StallingTransaction {
        inner: Box<dyn HistoryTransaction>,
    }

    #[async_trait]
    impl HistoryStore for StallingStore {
        async fn begin(
            &self,
            user_id: Uuid,
        ) -> crate::database::Result<Box<dyn HistoryTransaction>> {
            Ok(Box::new(StallingTransaction {
                inner: self.inner.begin(user_id).await?,
            }))
        }

        async fn list(
            &self,
            user_id: Uuid,
            limit: Option<i64>,
        ) -> crate::database::Result<Vec<Entry>> {
            self.inner.list(user_id, limit).await
        }

        async fn delete_by_user_and_ips(
            &self,
            user_id: Uuid,
            ips: &[String],
        ) -> crate::database::Result<u64> {
            self.inner.delete_by_user_and_ips(user_id, ips).await
        }

        async fn delete_by_user(&self, user_id: Uuid) -> crate::database::Result<u64> {
            self.inner.delete_by_user(user_id).await
        }
    }

    #[async_trait]
    impl HistoryTransaction for StallingTransaction {
        async fn find_one(
            &mut self,
            user_id: Uuid,
            ip: &str,
        ) -> crate::database::Result<Option<Entry>> {
            self.inner.find_one(user_id, ip).await
        }

        async fn insert(
            &mut self,
            user_id: Uuid,
            entry: &NewEntry,
            created_at: DateTime<Utc>,
        ) -> crate::database::Result<Entry> {
            self.inner.insert(user_id, entry, created_at).await?;
            std::future::pending().await
        }

        async fn update_recency(
            &mut self,
            id: i64,
            now: DateTime<Utc>,
        ) -> crate::database::Result<Entry> {
            self.inner.update_recency(id, now).await
        }

        async fn list(&mut self, user_id: Uuid) -> crate::database::Result<Vec<Entry>> {
            self.inner.list(user_id).await
        }

        async fn delete_by_ids(&mut self, ids: &[i64]) -> crate::database::Result<u64> {
            self.inner.delete_by_ids(ids).await
        }

        async fn commit(self: Box<Self>) -> crate::database::Result<()> {
            self.inner.commit().await
        }
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let store = MemoryStore::new();
        let user = store.insert("admin@example.com", "hash", "Admin").await.unwrap();
        let history = HistoryService::new(
            Arc::new(StallingStore {
                inner: store.clone(),
            }),
            Arc::new(SteppingClock::default()),
            Duration::from_secs(5),
        )
        .with_timeout(Duration::from_millis(50));

        let err = history
            .upsert(user.id, NewEntry::new("1.1.1.1"))
            .await
            .unwrap_err();

        assert!(matches!(err, HistoryError::Storage(StoreError::Timeout)));
        assert!(
            HistoryStore::list(&store, user.id, None)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
