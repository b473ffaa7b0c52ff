//! Rate limiting logic and state management.

mod clock;
mod identity;
mod janitor;
mod limiter;
mod registry;
mod rules;
pub mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{IdentityExtractor, IdentityKey};
pub use janitor::{Janitor, JanitorHandle};
pub use limiter::{Decision, RateLimitStatus, RateLimiter};
pub use registry::LimiterRegistry;
pub use rules::{CountingPolicy, FailurePolicy, LimitPolicy, RateLimitRules};
pub use store::{MemoryWindowStore, PostgresWindowStore, StoreProvider, WindowStore};
pub use window::WindowRecord;
