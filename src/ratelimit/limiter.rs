//! Core rate limiter implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::identity::{IdentityExtractor, IdentityKey};
use super::rules::{CountingPolicy, FailurePolicy, LimitPolicy};
use super::store::WindowStore;
use super::window::WindowRecord;
use crate::error::{GuardError, Result};

/// Whether an attempt may proceed to the protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt is within the limit
    Admit,
    /// The identity has used up its window
    Reject,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Admit or reject
    pub decision: Decision,
    /// Maximum admitted attempts per window
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// Time until the current window resets
    pub retry_after: Duration,
}

impl RateLimitStatus {
    /// Whether the attempt was admitted.
    pub fn is_admitted(&self) -> bool {
        self.decision == Decision::Admit
    }
}

/// A fixed-window rate limiter for one protected operation.
///
/// Each identity gets a window of `window_length_ms` holding at most
/// `max_per_window` admissions. Windows are not aligned across identities and
/// a burst straddling a window boundary can see up to twice the limit.
pub struct RateLimiter {
    /// Operation name, used in logs
    name: String,
    /// Window state indexed by identity
    store: Arc<dyn WindowStore>,
    /// Limits for this operation
    policy: LimitPolicy,
    /// How callers are identified in [`RateLimiter::check`]
    extractor: IdentityExtractor,
}

impl RateLimiter {
    /// Create a limiter over `store` with the given policy.
    pub fn new(store: Arc<dyn WindowStore>, policy: LimitPolicy) -> Self {
        Self {
            name: "default".to_string(),
            store,
            policy,
            extractor: IdentityExtractor::default(),
        }
    }

    /// Set the operation name reported in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the identity extractor.
    pub fn with_extractor(mut self, extractor: IdentityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Decide whether `key` may make another attempt at `now`.
    ///
    /// Never fails: a store error is resolved through the policy's
    /// [`FailurePolicy`].
    pub async fn decide(&self, key: &IdentityKey, now: DateTime<Utc>) -> RateLimitStatus {
        let mut outcome = None;
        let result = self
            .store
            .update(key, &mut |current| {
                let (status, next) = next_window(current, now, &self.policy);
                outcome = Some(status);
                next
            })
            .await;

        match (result, outcome) {
            (Ok(_), Some(status)) => {
                trace!(
                    limiter = %self.name,
                    key = %key,
                    decision = ?status.decision,
                    remaining = status.remaining,
                    "Rate limit decision"
                );
                if !status.is_admitted() {
                    debug!(
                        limiter = %self.name,
                        key = %key,
                        retry_after_ms = status.retry_after.as_millis() as u64,
                        "Rate limit exceeded"
                    );
                }
                status
            }
            (Err(e), _) => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    policy = ?self.policy.on_store_error,
                    "Window store failed, applying failure policy"
                );
                self.failure_status()
            }
            (Ok(_), None) => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    "Window store skipped the update, applying failure policy"
                );
                self.failure_status()
            }
        }
    }

    /// Identify the caller from request metadata and decide.
    ///
    /// Returns [`GuardError::InvalidIdentity`] when the request carries no
    /// usable identity; the caller should answer with a client error.
    pub async fn check(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus> {
        let key = self.extractor.extract(headers, remote_addr)?;
        Ok(self.decide(&key, now).await)
    }

    /// Remove this limiter's expired windows.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store
            .purge_expired(now, self.policy.window_length())
            .await
            .map_err(|e| GuardError::SweepFailure(format!("limiter '{}': {}", self.name, e)))
    }

    /// The operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The limits this limiter enforces.
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// The underlying window store.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    fn failure_status(&self) -> RateLimitStatus {
        match self.policy.on_store_error {
            FailurePolicy::FailOpen => RateLimitStatus {
                decision: Decision::Admit,
                limit: self.policy.max_per_window,
                remaining: self.policy.max_per_window,
                retry_after: Duration::ZERO,
            },
            FailurePolicy::FailClosed => RateLimitStatus {
                decision: Decision::Reject,
                limit: self.policy.max_per_window,
                remaining: 0,
                retry_after: Duration::from_millis(self.policy.window_length_ms),
            },
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("extractor", &self.extractor)
            .finish()
    }
}

/// Fixed-window transition: the decision for this attempt and the record to
/// store, if any.
fn next_window(
    current: Option<WindowRecord>,
    now: DateTime<Utc>,
    policy: &LimitPolicy,
) -> (RateLimitStatus, Option<WindowRecord>) {
    let window = policy.window_length();
    let limit = policy.max_per_window;

    match current {
        Some(record) if !record.is_expired(now, window) => {
            let retry_after = record.duration_until_reset(now, window);

            if record.count >= limit {
                let next = match policy.counting {
                    CountingPolicy::AdmittedOnly => None,
                    CountingPolicy::EveryAttempt => Some(WindowRecord {
                        count: record.count.saturating_add(1),
                        window_start: record.window_start,
                    }),
                };
                let status = RateLimitStatus {
                    decision: Decision::Reject,
                    limit,
                    remaining: 0,
                    retry_after,
                };
                return (status, next);
            }

            let next = WindowRecord {
                count: record.count + 1,
                window_start: record.window_start,
            };
            let status = RateLimitStatus {
                decision: Decision::Admit,
                limit,
                remaining: limit.saturating_sub(next.count),
                retry_after,
            };
            (status, Some(next))
        }
        // First sight, or the previous window has run out
        _ => {
            let next = WindowRecord::fresh(now);
            let status = RateLimitStatus {
                decision: Decision::Admit,
                limit,
                remaining: limit.saturating_sub(next.count),
                retry_after: next.duration_until_reset(now, window),
            };
            (status, Some(next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::testing::UnavailableStore;
    use crate::ratelimit::store::MemoryWindowStore;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn limiter(window_length_ms: u64, max_per_window: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryWindowStore::new()),
            LimitPolicy::new(window_length_ms, max_per_window),
        )
    }

    #[tokio::test]
    async fn test_first_attempt_is_admitted() {
        let limiter = limiter(60_000, 3);
        let key = IdentityKey::from("203.0.113.5");

        let status = limiter.decide(&key, at(0)).await;

        assert_eq!(status.decision, Decision::Admit);
        assert_eq!(status.limit, 3);
        assert_eq!(status.remaining, 2);
        assert_eq!(status.retry_after, Duration::from_secs(60));
        assert_eq!(limiter.store().get(&key).await.unwrap(), Some(WindowRecord::fresh(at(0))));
    }

    #[tokio::test]
    async fn test_window_scenario() {
        let limiter = limiter(60_000, 3);
        let key = IdentityKey::from("A");

        let decisions: Vec<Decision> = {
            let mut out = Vec::new();
            for t in [0, 10, 20, 30] {
                out.push(limiter.decide(&key, at(t)).await.decision);
            }
            out
        };
        assert_eq!(
            decisions,
            vec![Decision::Admit, Decision::Admit, Decision::Admit, Decision::Reject]
        );

        // A new window opens once the old one has run out
        let status = limiter.decide(&key, at(61_000)).await;
        assert_eq!(status.decision, Decision::Admit);
        assert_eq!(
            limiter.store().get(&key).await.unwrap(),
            Some(WindowRecord::fresh(at(61_000)))
        );
    }

    #[tokio::test]
    async fn test_reject_leaves_record_unchanged() {
        let limiter = limiter(60_000, 2);
        let key = IdentityKey::from("A");

        limiter.decide(&key, at(0)).await;
        limiter.decide(&key, at(1)).await;
        let before = limiter.store().get(&key).await.unwrap();

        let status = limiter.decide(&key, at(2)).await;
        assert_eq!(status.decision, Decision::Reject);
        assert_eq!(status.remaining, 0);
        assert_eq!(limiter.store().get(&key).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_every_attempt_counts_rejections() {
        let policy = LimitPolicy {
            counting: CountingPolicy::EveryAttempt,
            ..LimitPolicy::new(60_000, 2)
        };
        let limiter = RateLimiter::new(Arc::new(MemoryWindowStore::new()), policy);
        let key = IdentityKey::from("A");

        for t in 0..5 {
            limiter.decide(&key, at(t)).await;
        }

        let record = limiter.store().get(&key).await.unwrap().unwrap();
        assert_eq!(record.count, 5);
        assert_eq!(record.window_start, at(0));
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let limiter = limiter(60_000, 1);
        let key = IdentityKey::from("A");

        limiter.decide(&key, at(0)).await;
        let status = limiter.decide(&key, at(15_000)).await;

        assert_eq!(status.decision, Decision::Reject);
        assert_eq!(status.retry_after, Duration::from_millis(45_000));
    }

    #[tokio::test]
    async fn test_window_boundary_is_inclusive() {
        let limiter = limiter(1_000, 1);
        let key = IdentityKey::from("A");

        limiter.decide(&key, at(0)).await;

        // Exactly one window later is still inside the window
        assert_eq!(limiter.decide(&key, at(1_000)).await.decision, Decision::Reject);
        assert_eq!(limiter.decide(&key, at(1_001)).await.decision, Decision::Admit);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let limiter = limiter(60_000, 1);
        let a = IdentityKey::from("A");
        let b = IdentityKey::from("B");

        assert!(limiter.decide(&a, at(0)).await.is_admitted());
        assert!(!limiter.decide(&a, at(1)).await.is_admitted());

        assert!(limiter.decide(&b, at(2)).await.is_admitted());
        assert_eq!(limiter.store().get(&b).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), LimitPolicy::new(60_000, 3));

        let status = limiter.decide(&IdentityKey::from("A"), at(0)).await;

        assert_eq!(status.decision, Decision::Admit);
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_closed() {
        let policy = LimitPolicy {
            on_store_error: FailurePolicy::FailClosed,
            ..LimitPolicy::new(60_000, 3)
        };
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), policy);

        let status = limiter.decide(&IdentityKey::from("A"), at(0)).await;

        assert_eq!(status.decision, Decision::Reject);
        assert_eq!(status.retry_after, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_check_uses_forwarded_address() {
        let limiter = limiter(60_000, 1);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));

        assert!(limiter.check(&headers, None, at(0)).await.unwrap().is_admitted());
        assert!(!limiter.check(&headers, None, at(1)).await.unwrap().is_admitted());
        assert!(limiter
            .store()
            .get(&IdentityKey::from("203.0.113.5"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_check_without_identity_is_invalid() {
        let config = crate::config::IdentityConfig {
            fallback: None,
            ..Default::default()
        };
        let extractor = IdentityExtractor::from_config(&config).unwrap();
        let limiter = limiter(60_000, 1).with_extractor(extractor);

        let result = limiter.check(&HeaderMap::new(), None, at(0)).await;

        assert!(matches!(result, Err(GuardError::InvalidIdentity(_))));
        assert_eq!(limiter.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_windows() {
        let limiter = limiter(60_000, 5);
        limiter.decide(&IdentityKey::from("old"), at(0)).await;
        limiter.decide(&IdentityKey::from("new"), at(30_000)).await;

        assert_eq!(limiter.sweep(at(61_000)).await.unwrap(), 1);
        assert_eq!(limiter.sweep(at(61_000)).await.unwrap(), 0);
        assert_eq!(limiter.store().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_failure_is_reported() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), LimitPolicy::default()).named("click");

        let err = limiter.sweep(at(0)).await.unwrap_err();

        assert!(matches!(err, GuardError::SweepFailure(_)));
        assert!(err.to_string().contains("click"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_admits_exactly_the_limit() {
        let limiter = Arc::new(limiter(60_000, 10));
        let key = IdentityKey::from("burst");

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.decide(&key, at(i)).await })
            })
            .collect();

        let statuses = futures::future::join_all(handles).await;
        let admitted = statuses
            .into_iter()
            .map(|s| s.unwrap())
            .filter(RateLimitStatus::is_admitted)
            .count();

        assert_eq!(admitted, 10);
    }
}
