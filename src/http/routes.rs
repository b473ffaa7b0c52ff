//! Click board routes.
//!
//! A small in-memory click counter and leaderboard standing in for the
//! database-backed handlers; the click and leaderboard routes sit behind
//! their operation's rate limiter.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::middleware::{rate_limit_middleware, OperationGuard};
use crate::ratelimit::{Clock, LimiterRegistry};

/// Operation guarding `POST /api/click`.
pub const CLICK_OPERATION: &str = "click";
/// Operation guarding `GET /api/leaderboard`.
pub const LEADERBOARD_OPERATION: &str = "leaderboard";
/// Every operation the router guards.
pub const OPERATIONS: [&str; 2] = [CLICK_OPERATION, LEADERBOARD_OPERATION];

const USERNAME_HEADER: &str = "x-username";
const LEADERBOARD_SIZE: usize = 10;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Limiters by operation
    pub registry: Arc<LimiterRegistry>,
    /// Time source for rate limit decisions
    pub clock: Arc<dyn Clock>,
    /// Click counts by username
    pub board: Arc<ClickBoard>,
}

impl AppState {
    /// Create state with an empty click board.
    pub fn new(registry: Arc<LimiterRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            board: Arc::new(ClickBoard::default()),
        }
    }

    /// The middleware state for an operation, if it has a limiter.
    pub fn guard(&self, operation: &str) -> Option<OperationGuard> {
        self.registry
            .get(operation)
            .map(|limiter| OperationGuard::new(limiter, self.clock.clone()))
    }
}

/// In-memory click counts.
#[derive(Debug, Default)]
pub struct ClickBoard {
    counts: DashMap<String, u64>,
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub click_count: u64,
}

impl ClickBoard {
    /// Add a click for `username` and return the new total.
    pub fn record(&self, username: &str) -> u64 {
        let mut count = self.counts.entry(username.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current clicks for `username`.
    pub fn count(&self, username: &str) -> Option<u64> {
        self.counts.get(username).map(|c| *c)
    }

    /// The `n` users with the most clicks, highest first; ties by name.
    pub fn top(&self, n: usize) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .counts
            .iter()
            .map(|e| LeaderboardEntry {
                username: e.key().clone(),
                click_count: *e.value(),
            })
            .collect();
        entries.sort_by(|a, b| {
            b.click_count
                .cmp(&a.click_count)
                .then_with(|| a.username.cmp(&b.username))
        });
        entries.truncate(n);
        entries
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let click = guarded(
        Router::new().route("/api/click", post(record_click)),
        &state,
        CLICK_OPERATION,
    );
    let leaderboard = guarded(
        Router::new().route("/api/leaderboard", get(leaderboard)),
        &state,
        LEADERBOARD_OPERATION,
    );

    Router::new()
        .route("/health", get(health))
        .route("/api/clicks", get(get_clicks))
        .merge(click)
        .merge(leaderboard)
        .with_state(state)
}

fn guarded(routes: Router<AppState>, state: &AppState, operation: &str) -> Router<AppState> {
    match state.guard(operation) {
        Some(guard) => routes.route_layer(middleware::from_fn_with_state(guard, rate_limit_middleware)),
        None => {
            warn!(operation, "No rate limiter registered, route is unguarded");
            routes
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClickResponse {
    click_count: u64,
}

#[derive(Debug, Serialize)]
struct LeaderboardResponse {
    leaderboard: Vec<LeaderboardEntry>,
}

/// Errors returned by the click handlers.
#[derive(Debug)]
enum ApiError {
    MissingUsername,
    UserNotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingUsername => (StatusCode::BAD_REQUEST, "Missing username"),
            ApiError::UserNotFound => (StatusCode::NOT_FOUND, "User not found"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn username(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(USERNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingUsername)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn record_click(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClickResponse>, ApiError> {
    let username = username(&headers)?;
    let click_count = state.board.record(username);
    info!(username, click_count, "Click recorded");
    Ok(Json(ClickResponse { click_count }))
}

async fn get_clicks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClickResponse>, ApiError> {
    let username = username(&headers)?;
    let click_count = state.board.count(username).ok_or(ApiError::UserNotFound)?;
    Ok(Json(ClickResponse { click_count }))
}

async fn leaderboard(State(state): State<AppState>) -> Json<LeaderboardResponse> {
    Json(LeaderboardResponse {
        leaderboard: state.board.top(LEADERBOARD_SIZE),
    })
}
