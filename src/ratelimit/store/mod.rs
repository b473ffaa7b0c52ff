//! Window store trait for abstracting in-memory and persistent backends.

mod memory;
mod postgres;

pub use memory::MemoryWindowStore;
pub use postgres::PostgresWindowStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use super::identity::IdentityKey;
use super::window::WindowRecord;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{GuardError, Result};

/// Authoritative mapping from [`IdentityKey`] to [`WindowRecord`].
///
/// Persistent implementations report backend failures as
/// [`GuardError::StoreUnavailable`]; the limiter decides what that means for
/// the request.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Fetch the record for a key.
    async fn get(&self, key: &IdentityKey) -> Result<Option<WindowRecord>>;

    /// Insert or overwrite the record for a key.
    async fn put(&self, key: &IdentityKey, record: WindowRecord) -> Result<()>;

    /// Remove the record for a key. Returns whether a record was removed.
    async fn delete(&self, key: &IdentityKey) -> Result<bool>;

    /// Visit every record.
    async fn for_each(&self, visit: &mut (dyn for<'k> FnMut(&'k IdentityKey, &'k WindowRecord) + Send)) -> Result<()>;

    /// Number of records currently held.
    async fn len(&self) -> Result<usize>;

    /// Read-modify-write a single key.
    ///
    /// `transition` receives the current record and returns the record to
    /// store, or `None` to leave the store untouched. Returns the record as it
    /// stands afterwards.
    ///
    /// The default implementation is a plain `get` followed by `put`, so two
    /// concurrent updates of the same key may interleave. Implementations
    /// that can lock a key should override it.
    async fn update(
        &self,
        key: &IdentityKey,
        transition: &mut (dyn FnMut(Option<WindowRecord>) -> Option<WindowRecord> + Send),
    ) -> Result<Option<WindowRecord>> {
        let current = self.get(key).await?;
        match transition(current.clone()) {
            Some(next) => {
                self.put(key, next.clone()).await?;
                Ok(Some(next))
            }
            None => Ok(current),
        }
    }

    /// Delete every record whose window ended before `now`.
    ///
    /// Returns the number of records removed.
    async fn purge_expired(&self, now: DateTime<Utc>, window_length: Duration) -> Result<usize> {
        let mut expired = Vec::new();
        self.for_each(&mut |key, record| {
            if record.is_expired(now, window_length) {
                expired.push(key.clone());
            }
        })
        .await?;

        let mut removed = 0;
        for key in &expired {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Hands out one window store per protected operation.
#[derive(Debug, Clone)]
pub enum StoreProvider {
    /// Each operation gets its own in-process map
    Memory,
    /// All operations share one table, separated by key scope
    Postgres(PostgresWindowStore),
}

impl StoreProvider {
    /// Build a provider for the configured backend.
    ///
    /// Postgres pools connect lazily so an unreachable database does not
    /// prevent startup; the limiter's failure policy covers it per request.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(StoreProvider::Memory),
            StoreBackend::Postgres => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    GuardError::Config("store.database_url is required for the postgres backend".to_string())
                })?;
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(std::time::Duration::from_millis(config.acquire_timeout_ms))
                    .connect_lazy(url)
                    .map_err(|e| GuardError::Config(format!("invalid database_url: {}", e)))?;
                Ok(StoreProvider::Postgres(PostgresWindowStore::new(pool)))
            }
        }
    }

    /// Prepare the backend before serving (creates the table for Postgres).
    ///
    /// A failure here is not final: Postgres stores keep retrying the schema
    /// on use until it succeeds.
    pub async fn prepare(&self) -> Result<()> {
        match self {
            StoreProvider::Memory => Ok(()),
            StoreProvider::Postgres(base) => {
                base.ensure_schema().await?;
                info!("Postgres window store ready");
                Ok(())
            }
        }
    }

    /// A store for the named operation.
    pub fn store_for(&self, operation: &str) -> Arc<dyn WindowStore> {
        match self {
            StoreProvider::Memory => Arc::new(MemoryWindowStore::new()),
            StoreProvider::Postgres(base) => Arc::new(base.clone().with_scope(operation)),
        }
    }
}
