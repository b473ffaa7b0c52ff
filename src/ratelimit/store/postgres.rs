//! PostgreSQL window store.
//!
//! Persists windows in a single table so several processes share counters:
//!
//! ```sql
//! CREATE TABLE rate_limit_windows (
//!     identity_key TEXT PRIMARY KEY,
//!     count        BIGINT NOT NULL,
//!     window_start TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The table is created by [`PostgresWindowStore::ensure_schema`]. Until that
//! has succeeded once, every operation tries it first, so a database that was
//! down at startup is usable as soon as it comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::WindowStore;
use crate::error::{GuardError, Result};
use crate::ratelimit::identity::IdentityKey;
use crate::ratelimit::window::WindowRecord;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_windows (
    identity_key TEXT PRIMARY KEY,
    count        BIGINT NOT NULL,
    window_start TIMESTAMPTZ NOT NULL
)
"#;

/// PostgreSQL implementation of [`WindowStore`].
///
/// With a scope set, keys are stored as `{scope}:{key}` and every query only
/// sees rows under that scope. Clones share the pool and the schema state.
#[derive(Debug, Clone)]
pub struct PostgresWindowStore {
    pool: PgPool,
    scope: Option<String>,
    schema_ready: Arc<AtomicBool>,
}

impl PostgresWindowStore {
    /// Create an unscoped store on the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            scope: None,
            schema_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restrict this store to keys under `scope`.
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    /// Create the windows table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(unavailable("create rate_limit_windows table"))?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the windows table is known to exist.
    pub fn is_schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::Acquire)
    }

    async fn ready(&self) -> Result<()> {
        if !self.is_schema_ready() {
            self.ensure_schema().await?;
            info!(scope = self.scope.as_deref().unwrap_or(""), "Created window table on first use");
        }
        Ok(())
    }

    fn stored_key(&self, key: &IdentityKey) -> String {
        scoped_key(self.scope.as_deref(), key)
    }

    fn prefix(&self) -> String {
        scope_prefix(self.scope.as_deref())
    }
}

fn scope_prefix(scope: Option<&str>) -> String {
    scope.map(|s| format!("{}:", s)).unwrap_or_default()
}

fn scoped_key(scope: Option<&str>, key: &IdentityKey) -> String {
    format!("{}{}", scope_prefix(scope), key)
}

fn unscoped_key(scope: Option<&str>, stored: &str) -> Option<IdentityKey> {
    stored
        .strip_prefix(scope_prefix(scope).as_str())
        .map(IdentityKey::new)
}

fn unavailable(action: &'static str) -> impl Fn(sqlx::Error) -> GuardError {
    move |e| GuardError::StoreUnavailable(format!("Failed to {}: {}", action, e))
}

fn row_to_record(row: &PgRow) -> Result<WindowRecord> {
    let count: i64 = row.try_get("count").map_err(unavailable("decode count"))?;
    let window_start: DateTime<Utc> = row
        .try_get("window_start")
        .map_err(unavailable("decode window_start"))?;

    Ok(WindowRecord {
        count: u64::try_from(count).unwrap_or(0),
        window_start,
    })
}

/// Windows starting before this instant have expired at `now`.
fn purge_cutoff(now: DateTime<Utc>, window_length: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(window_length)
}

fn count_param(record: &WindowRecord) -> i64 {
    i64::try_from(record.count).unwrap_or(i64::MAX)
}

#[async_trait]
impl WindowStore for PostgresWindowStore {
    async fn get(&self, key: &IdentityKey) -> Result<Option<WindowRecord>> {
        self.ready().await?;
        let row = sqlx::query(
            "SELECT count, window_start FROM rate_limit_windows WHERE identity_key = $1",
        )
        .bind(self.stored_key(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("fetch window"))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn put(&self, key: &IdentityKey, record: WindowRecord) -> Result<()> {
        self.ready().await?;
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (identity_key, count, window_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (identity_key)
            DO UPDATE SET count = EXCLUDED.count, window_start = EXCLUDED.window_start
            "#,
        )
        .bind(self.stored_key(key))
        .bind(count_param(&record))
        .bind(record.window_start)
        .execute(&self.pool)
        .await
        .map_err(unavailable("upsert window"))?;
        Ok(())
    }

    async fn delete(&self, key: &IdentityKey) -> Result<bool> {
        self.ready().await?;
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE identity_key = $1")
            .bind(self.stored_key(key))
            .execute(&self.pool)
            .await
            .map_err(unavailable("delete window"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn for_each(&self, visit: &mut (dyn for<'k> FnMut(&'k IdentityKey, &'k WindowRecord) + Send)) -> Result<()> {
        self.ready().await?;
        let prefix = self.prefix();
        let rows = sqlx::query(
            r#"
            SELECT identity_key, count, window_start
            FROM rate_limit_windows
            WHERE starts_with(identity_key, $1)
            "#,
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("list windows"))?;

        for row in &rows {
            let stored: String = row.try_get("identity_key").map_err(unavailable("decode identity_key"))?;
            if let Some(key) = unscoped_key(self.scope.as_deref(), &stored) {
                visit(&key, &row_to_record(row)?);
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        self.ready().await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_windows WHERE starts_with(identity_key, $1)",
        )
        .bind(self.prefix())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable("count windows"))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Runs the transition inside one transaction holding a transaction-scoped
    /// advisory lock on the key, so same-key updates from any process
    /// serialize even before the row exists.
    async fn update(
        &self,
        key: &IdentityKey,
        transition: &mut (dyn FnMut(Option<WindowRecord>) -> Option<WindowRecord> + Send),
    ) -> Result<Option<WindowRecord>> {
        self.ready().await?;
        let stored_key = self.stored_key(key);

        let mut tx = self.pool.begin().await.map_err(unavailable("begin transaction"))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&stored_key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("lock window"))?;

        let row = sqlx::query(
            "SELECT count, window_start FROM rate_limit_windows WHERE identity_key = $1",
        )
        .bind(&stored_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable("fetch window"))?;
        let current = row.as_ref().map(row_to_record).transpose()?;

        let next = transition(current.clone());
        if let Some(ref record) = next {
            if Some(record) != current.as_ref() {
                sqlx::query(
                    r#"
                    INSERT INTO rate_limit_windows (identity_key, count, window_start)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (identity_key)
                    DO UPDATE SET count = EXCLUDED.count, window_start = EXCLUDED.window_start
                    "#,
                )
                .bind(&stored_key)
                .bind(count_param(record))
                .bind(record.window_start)
                .execute(&mut *tx)
                .await
                .map_err(unavailable("upsert window"))?;
            }
        }

        tx.commit().await.map_err(unavailable("commit transaction"))?;

        Ok(next.or(current))
    }

    async fn purge_expired(&self, now: DateTime<Utc>, window_length: Duration) -> Result<usize> {
        // No stored window can start before the earliest representable instant
        let Some(cutoff) = purge_cutoff(now, window_length) else {
            return Ok(0);
        };
        self.ready().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM rate_limit_windows
            WHERE starts_with(identity_key, $1) AND window_start < $2
            "#,
        )
        .bind(self.prefix())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(unavailable("purge expired windows"))?;

        debug!(
            scope = self.scope.as_deref().unwrap_or(""),
            removed = result.rows_affected(),
            "Purged expired windows"
        );
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
