mod common;

use axum::http::{Method, StatusCode};
use common::{mint_token, TestApp, BIC, IBAN};
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::GET, "/api/v1/customers", None, None)
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_code(), "AUTHENTICATION_FAILED");
}

#[tokio::test]
async fn garbage_token_is_unauthorized() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::GET, "/api/v1/accounts", None, Some("not.a.jwt"))
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_signed_with_another_key_is_unauthorized() {
    let app = TestApp::new().await;
    let claims = json!({ "sub": "mallory", "exp": chrono::Utc::now().timestamp() + 600, "roles": ["admin"] });
    let forged = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"some-other-secret-that-is-long-enough"),
    )
    .expect("encode");

    let response = app
        .request(Method::GET, "/api/v1/cards", None, Some(&forged))
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_is_open() {
    let app = TestApp::new().await;

    let live = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(live.status, StatusCode::OK);
    assert_eq!(live.body["status"], "up");

    let ready = app.request(Method::GET, "/health/ready", None, None).await;
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(ready.body["details"]["database"]["status"], "up");
}

#[tokio::test]
async fn read_permission_does_not_allow_writes() {
    let app = TestApp::new().await;
    let reader = mint_token(&[], &["customer:read"]);

    let list = app
        .request(Method::GET, "/api/v1/customers", None, Some(&reader))
        .await;
    assert_eq!(list.status, StatusCode::OK);

    let create = app
        .request(
            Method::POST,
            "/api/v1/customers",
            Some(json!({ "firstName": "Ada", "lastName": "Lovelace" })),
            Some(&reader),
        )
        .await;
    assert_eq!(create.status, StatusCode::FORBIDDEN);
    assert_eq!(create.error_code(), "ACCESS_DENIED");
}

#[tokio::test]
async fn permissions_are_per_resource() {
    let app = TestApp::new().await;
    let customer_id = app.create_customer("Ada", "Lovelace").await;
    let customer_clerk = mint_token(&[], &["customer:read", "customer:create"]);

    let accounts = app
        .request(Method::GET, "/api/v1/accounts", None, Some(&customer_clerk))
        .await;
    assert_eq!(accounts.status, StatusCode::FORBIDDEN);

    let nested = app
        .request(
            Method::POST,
            &format!("/api/v1/customers/{}/accounts", customer_id),
            Some(json!({ "iban": IBAN, "bicSwift": BIC })),
            Some(&customer_clerk),
        )
        .await;
    assert_eq!(nested.status, StatusCode::FORBIDDEN);

    let account_clerk = mint_token(&[], &["account:create"]);
    let allowed = app
        .request(
            Method::POST,
            &format!("/api/v1/customers/{}/accounts", customer_id),
            Some(json!({ "iban": IBAN, "bicSwift": BIC })),
            Some(&account_clerk),
        )
        .await;
    assert_eq!(allowed.status, StatusCode::CREATED, "{}", allowed.body);
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::new().await;

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-me-123")
                .body(axum::body::Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("trace-me-123")
    );
}
