//! In-process store, mirroring the PostgreSQL schema constraints.
//!
//! A unit of work holds the store lock until it is committed or dropped and
//! edits a private copy of the rows, so dropped work leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::database::{Result, StoreError};
use crate::history::{
    Entry, HistoryStore, HistoryTransaction, MAX_ENTRIES, NewEntry,
    sort_by_recency,
};
use crate::user::{User, UserRepository};

#[derive(Clone, Debug, Default)]
struct State {
    users: HashMap<Uuid, User>,
    history: Vec<Entry>,
    last_id: i64,
}

impl State {
    fn entries_of(&self, user_id: Uuid) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .history
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        sort_by_recency(&mut entries);
        entries
    }

    /// Same check as the `history_cap` constraint trigger.
    fn check_cap(&self) -> Result<()> {
        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for entry in &self.history {
            let count = counts.entry(entry.user_id).or_default();
            *count += 1;
            if *count > MAX_ENTRIES {
                return Err(StoreError::CapExceeded);
            }
        }
        Ok(())
    }
}

/// Memory-backed users and history.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty [`MemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a user and, like `ON DELETE CASCADE`, its history.
    #[cfg(test)]
    pub async fn remove_user(&self, user_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        state.history.retain(|e| e.user_id != user_id);
        state.users.remove(&user_id).is_some()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn begin(&self, _user_id: Uuid) -> Result<Box<dyn HistoryTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();

        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn list(&self, user_id: Uuid, limit: Option<i64>) -> Result<Vec<Entry>> {
        let entries = self.state.lock().await.entries_of(user_id);

        Ok(match limit {
            Some(limit) => entries
                .into_iter()
                .take(usize::try_from(limit).unwrap_or_default())
                .collect(),
            None => entries,
        })
    }

    async fn delete_by_user_and_ips(
        &self,
        user_id: Uuid,
        ips: &[String],
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state
            .history
            .retain(|e| e.user_id != user_id || !ips.contains(&e.ip));

        Ok((before - state.history.len()) as u64)
    }

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state.history.retain(|e| e.user_id != user_id);

        Ok((before - state.history.len()) as u64)
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl HistoryTransaction for MemoryTransaction {
    async fn find_one(&mut self, user_id: Uuid, ip: &str) -> Result<Option<Entry>> {
        Ok(self
            .working
            .history
            .iter()
            .find(|e| e.user_id == user_id && e.ip == ip)
            .cloned())
    }

    async fn insert(
        &mut self,
        user_id: Uuid,
        entry: &NewEntry,
        created_at: DateTime<Utc>,
    ) -> Result<Entry> {
        if !self.working.users.contains_key(&user_id) {
            return Err(StoreError::ForeignKey);
        }
        if self
            .working
            .history
            .iter()
            .any(|e| e.user_id == user_id && e.ip == entry.ip)
        {
            return Err(StoreError::DuplicateKey);
        }

        self.working.last_id += 1;
        let entry =
            entry
                .clone()
                .into_entry(self.working.last_id, user_id, created_at);
        self.working.history.push(entry.clone());

        Ok(entry)
    }

    async fn update_recency(&mut self, id: i64, now: DateTime<Utc>) -> Result<Entry> {
        let entry = self
            .working
            .history
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        entry.created_at = now;

        Ok(entry.clone())
    }

    async fn list(&mut self, user_id: Uuid) -> Result<Vec<Entry>> {
        Ok(self.working.entries_of(user_id))
    }

    async fn delete_by_ids(&mut self, ids: &[i64]) -> Result<u64> {
        let before = self.working.history.len();
        self.working.history.retain(|e| !ids.contains(&e.id));

        Ok((before - self.working.history.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, working } = *self;
        working.check_cap()?;
        *guard = working;

        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn insert(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<User> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.email == email) {
            return Err(StoreError::DuplicateKey);
        }

        let user = User {
            id: Uuid::new_v4(),
            email: email.to_owned(),
            password: password_hash.to_owned(),
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());

        Ok(user)
    }
}
