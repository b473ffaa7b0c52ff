//! HTTP surface: rate limiting middleware, click board routes, and server.

mod middleware;
mod routes;
mod server;

pub use middleware::{headers, rate_limit_middleware, OperationGuard};
pub use routes::{
    router, AppState, ClickBoard, LeaderboardEntry, CLICK_OPERATION, LEADERBOARD_OPERATION, OPERATIONS,
};
pub use server::HttpServer;
