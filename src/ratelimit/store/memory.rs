//! In-process window store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::WindowStore;
use crate::error::Result;
use crate::ratelimit::identity::IdentityKey;
use crate::ratelimit::window::WindowRecord;

/// A window store held in a sharded concurrent map.
///
/// `update` runs the transition while holding the key's shard lock, so
/// concurrent attempts from the same identity are applied one at a time.
/// Records are only reclaimed by [`WindowStore::purge_expired`]; without a
/// janitor the map grows with every distinct identity seen. A purge scans
/// under read locks and write-locks one key at a time.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    records: DashMap<IdentityKey, WindowRecord>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys whose window has run out, collected under shard read locks.
    fn expired_keys(&self, now: DateTime<Utc>, window_length: Duration) -> Vec<IdentityKey> {
        self.records
            .iter()
            .filter(|entry| entry.value().is_expired(now, window_length))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove each key that is still expired; a window renewed since it was
    /// collected is kept.
    fn remove_expired(&self, keys: &[IdentityKey], now: DateTime<Utc>, window_length: Duration) -> usize {
        keys.iter()
            .filter(|key| {
                self.records
                    .remove_if(*key, |_, record| record.is_expired(now, window_length))
                    .is_some()
            })
            .count()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn get(&self, key: &IdentityKey) -> Result<Option<WindowRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &IdentityKey, record: WindowRecord) -> Result<()> {
        self.records.insert(key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &IdentityKey) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    async fn for_each(&self, visit: &mut (dyn for<'k> FnMut(&'k IdentityKey, &'k WindowRecord) + Send)) -> Result<()> {
        for entry in self.records.iter() {
            visit(entry.key(), entry.value());
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }

    async fn update(
        &self,
        key: &IdentityKey,
        transition: &mut (dyn FnMut(Option<WindowRecord>) -> Option<WindowRecord> + Send),
    ) -> Result<Option<WindowRecord>> {
        let after = match self.records.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(next) = transition(Some(occupied.get().clone())) {
                    occupied.insert(next);
                }
                Some(occupied.get().clone())
            }
            Entry::Vacant(vacant) => {
                let next = transition(None);
                if let Some(ref record) = next {
                    vacant.insert(record.clone());
                }
                next
            }
        };
        Ok(after)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, window_length: Duration) -> Result<usize> {
        let expired = self.expired_keys(now, window_length);
        Ok(self.remove_expired(&expired, now, window_length))
    }
}
