//! One limiter per protected operation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::identity::IdentityExtractor;
use super::limiter::RateLimiter;
use super::rules::RateLimitRules;
use super::store::StoreProvider;

/// Limiters indexed by operation name.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    /// Build a limiter for every operation in `operations` and every
    /// operation named in `rules`.
    pub fn build<'a>(
        rules: &'a RateLimitRules,
        operations: impl IntoIterator<Item = &'a str>,
        provider: &StoreProvider,
        extractor: &IdentityExtractor,
    ) -> Self {
        let names: BTreeSet<&str> = operations
            .into_iter()
            .chain(rules.operations.keys().map(String::as_str))
            .collect();

        let limiters = names
            .into_iter()
            .map(|name| {
                let policy = rules.policy_for(name).clone();
                debug!(
                    operation = name,
                    window_length_ms = policy.window_length_ms,
                    max_per_window = policy.max_per_window,
                    "Creating rate limiter"
                );
                let limiter = RateLimiter::new(provider.store_for(name), policy)
                    .named(name)
                    .with_extractor(extractor.clone());
                (name.to_string(), Arc::new(limiter))
            })
            .collect();

        Self { limiters }
    }

    /// The limiter for an operation.
    pub fn get(&self, operation: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(operation).cloned()
    }

    /// All registered limiters.
    pub fn limiters(&self) -> impl Iterator<Item = &Arc<RateLimiter>> {
        self.limiters.values()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no operation is registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
