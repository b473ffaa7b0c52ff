//! Background removal of expired windows.
//!
//! Without sweeping, an in-memory store keeps one record per distinct
//! identity ever seen. The janitor runs on its own task and interval, so a
//! sweep never sits on the request path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::limiter::RateLimiter;
use super::registry::LimiterRegistry;

/// Periodically purges expired windows from a set of limiters.
#[derive(Debug)]
pub struct Janitor {
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
}

impl Janitor {
    /// Create a janitor for the given limiters.
    pub fn new(limiters: Vec<Arc<RateLimiter>>, interval: Duration) -> Self {
        Self {
            limiters,
            // tokio intervals cannot be zero
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Create a janitor covering every limiter in a registry.
    pub fn for_registry(registry: &LimiterRegistry, interval: Duration) -> Self {
        Self::new(registry.limiters().cloned().collect(), interval)
    }

    /// Remove every window that has run out at `now`.
    ///
    /// Limiters are swept concurrently. A failing limiter is logged and
    /// skipped. Returns the number of windows removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let results = join_all(self.limiters.iter().map(|limiter| async move {
            (limiter.name(), limiter.sweep(now).await)
        }))
        .await;

        let mut total = 0;
        for (name, result) in results {
            match result {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(limiter = %name, removed, "Swept expired windows");
                    }
                    total += removed;
                }
                Err(e) => {
                    warn!(limiter = %name, error = %e, "Janitor sweep failed");
                }
            }
        }
        total
    }

    /// Run the janitor on its own task until the handle is shut down.
    pub fn spawn(self, clock: Arc<dyn Clock>) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            limiters = self.limiters.len(),
            "Starting janitor"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep(clock.now()).await;
                        debug!(removed, "Janitor pass complete");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Janitor stopped");
        });

        JanitorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running janitor task.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the janitor and wait for its task to finish.
    pub async fn shutdown(self) {
        // The task also stops if the receiver is already gone
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Janitor task ended abnormally");
        }
    }
}
