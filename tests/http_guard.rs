use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, TimeZone, Utc};
use tower::ServiceExt;

use clickguard::config::IdentityConfig;
use clickguard::http::{router, AppState, OPERATIONS};
use clickguard::ratelimit::{
    IdentityExtractor, LimiterRegistry, ManualClock, RateLimitRules, StoreProvider,
};

const RULES: &str = r#"
default:
  window_length_ms: 60000
  max_per_window: 5
operations:
  click:
    window_length_ms: 60000
    max_per_window: 2
"#;

fn app_with(identity: IdentityConfig) -> (Router, Arc<ManualClock>) {
    let rules = RateLimitRules::from_yaml(RULES).unwrap();
    let extractor = IdentityExtractor::from_config(&identity).unwrap();
    let registry = LimiterRegistry::build(&rules, OPERATIONS, &StoreProvider::Memory, &extractor);
    let clock = Arc::new(ManualClock::new(Utc.timestamp_millis_opt(0).unwrap()));
    let state = AppState::new(Arc::new(registry), clock.clone());
    (router(state), clock)
}

fn app() -> (Router, Arc<ManualClock>) {
    app_with(IdentityConfig::default())
}

fn click(forwarded_for: &str, username: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/click")
        .header("x-forwarded-for", forwarded_for)
        .header("x-username", username)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_click_is_limited_per_forwarded_address() {
    let (app, _clock) = app();

    let first = app.clone().oneshot(click("203.0.113.5, 10.0.0.1", "alice")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "1");
    assert_eq!(json_body(first).await["clickCount"], 1);

    let second = app.clone().oneshot(click("203.0.113.5", "alice")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let third = app.clone().oneshot(click("203.0.113.5", "alice")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers().get("retry-after").unwrap(), "60");
    let body = json_body(third).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["retry_after_ms"], 60_000);

    // Another address has its own window
    let other = app.clone().oneshot(click("198.51.100.9", "alice")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(json_body(other).await["clickCount"], 3);
}

#[tokio::test]
async fn test_window_reset_readmits() {
    let (app, clock) = app();

    for _ in 0..2 {
        let response = app.clone().oneshot(click("203.0.113.5", "bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(click("203.0.113.5", "bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::milliseconds(61_000));

    let response = app.clone().oneshot(click("203.0.113.5", "bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "1");
}

#[tokio::test]
async fn test_rejected_click_does_not_reach_handler() {
    let (app, _clock) = app();

    for _ in 0..3 {
        app.clone().oneshot(click("203.0.113.5", "carol")).await.unwrap();
    }

    let request = Request::builder()
        .uri("/api/clicks")
        .header("x-username", "carol")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["clickCount"], 2);
}

#[tokio::test]
async fn test_peer_address_is_used_without_headers() {
    let (app, _clock) = app();
    let peer: SocketAddr = "192.0.2.44:40000".parse().unwrap();

    for expected in [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/click")
            .header("x-username", "dave")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn test_missing_identity_is_bad_request() {
    let (app, _clock) = app_with(IdentityConfig {
        fallback: None,
        ..IdentityConfig::default()
    });

    let request = Request::builder()
        .method("POST")
        .uri("/api/click")
        .header("x-username", "erin")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "INVALID_IDENTITY");
}

#[tokio::test]
async fn test_principal_header_limits_per_account() {
    let (app, _clock) = app_with(IdentityConfig {
        principal_header: Some("x-username".to_string()),
        ..IdentityConfig::default()
    });

    // Same account from different addresses shares one window
    for (addr, expected) in [
        ("203.0.113.5", StatusCode::OK),
        ("198.51.100.9", StatusCode::OK),
        ("192.0.2.1", StatusCode::TOO_MANY_REQUESTS),
    ] {
        let response = app.clone().oneshot(click(addr, "frank")).await.unwrap();
        assert_eq!(response.status(), expected);
    }

    let response = app.clone().oneshot(click("192.0.2.1", "grace")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_username_is_rejected_by_handler() {
    let (app, _clock) = app();

    let request = Request::builder()
        .method("POST")
        .uri("/api/click")
        .header("x-forwarded-for", "203.0.113.5")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "Missing username");
}

#[tokio::test]
async fn test_leaderboard_uses_default_policy() {
    let (app, _clock) = app();

    for user in ["heidi", "heidi", "ivan"] {
        app.clone().oneshot(click(&format!("10.1.0.{}", user.len()), user)).await.unwrap();
    }

    let leaderboard = || {
        Request::builder()
            .uri("/api/leaderboard")
            .header("x-forwarded-for", "203.0.113.77")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(leaderboard()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
    let body = json_body(response).await;
    assert_eq!(body["leaderboard"][0]["username"], "heidi");
    assert_eq!(body["leaderboard"][0]["click_count"], 2);
    assert_eq!(body["leaderboard"][1]["username"], "ivan");

    for _ in 0..4 {
        app.clone().oneshot(leaderboard()).await.unwrap();
    }
    let response = app.oneshot(leaderboard()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_health_and_unknown_user() {
    let (app, _clock) = app();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");

    let request = Request::builder()
        .uri("/api/clicks")
        .header("x-username", "nobody")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
