//! End-to-end tests against the full axum `Router`, mirroring the teacher's
//! `server/src/test.rs` style of driving the service through `tower::Service`
//! rather than unit-testing handlers directly.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;

use crate::{api, AppState};

fn test_state() -> AppState {
    AppState::new_in_memory("test-secret")
}

fn token(state: &AppState, sub: &str, tenant: &str, is_admin: bool) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = crate::Claims {
        sub: sub.to_string(),
        tenant_id: tenant.into(),
        is_admin,
        is_moderator: false,
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(state.jwt_secret.as_bytes())).unwrap()
}

#[tokio::test]
async fn health_of_create_tenant_round_trip() {
    let state = test_state();
    let bearer = token(&state, "u1", "t1", false);
    let app = api::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/tenants")
        .header("content-type", "application/json")
        .header("idempotency-key", "key-1")
        .header("authorization", format!("Bearer {bearer}"))
        .body(Body::from(r#"{"name":"acme"}"#))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_bearer_token_is_unauthorized() {
    let state = test_state();
    let app = api::router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/v1/networks")
        .body(Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mutation_without_idempotency_key_is_rejected() {
    let state = test_state();
    let bearer = token(&state, "u1", "t1", false);
    let app = api::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/tenants")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {bearer}"))
        .body(Body::from(r#"{"name":"acme"}"#))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
