#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use dtbank_api::{
    auth::{AuthConfig, AuthService, Claims},
    build_router, cascade_subscriptions,
    config::AppConfig,
    db,
    events::{self, consumers::Delivery, outbox::OutboxRelay, EventSender},
    handlers::AppServices,
    message_queue::{InMemoryMessageQueue, MessageQueue},
    AppState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::{sync::mpsc, task::JoinHandle};
use tower::ServiceExt;
use uuid::Uuid;

pub const SECRET: &str = "kX9vQ2mL7pR4tW8yB3nC6fH1jK5sD0gZ-uE7iO2aP9qT4wV6xM3bN8cY1rJ5hL0dS";

pub const IBAN: &str = "DE89370400440532013000";
pub const BIC: &str = "DEUTDEFF";
pub const VISA_PAN: &str = "4111111111111111";
pub const MASTERCARD_PAN: &str = "5500000000000004";

/// A JSON response as seen by a client.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestResponse {
    pub fn id(&self) -> Uuid {
        self.body["id"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(|| panic!("response has no id: {}", self.body))
    }

    pub fn error_code(&self) -> &str {
        self.body["errorCode"].as_str().unwrap_or_default()
    }

    pub fn content(&self) -> &Vec<Value> {
        self.body["content"]
            .as_array()
            .unwrap_or_else(|| panic!("response is not a page: {}", self.body))
    }

    pub fn total_elements(&self) -> u64 {
        self.body["page"]["totalElements"].as_u64().unwrap_or_default()
    }
}

/// All three services in one process on a throwaway SQLite file, with the
/// broker replaced by an in-memory queue that tests pump by hand.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub queue: Arc<InMemoryMessageQueue>,
    relay: OutboxRelay,
    token: String,
    _dir: TempDir,
    _event_task: JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("dtbank-test.db");
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "redis://127.0.0.1:6379".to_string(),
            SECRET.to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("connect test database");
        db::run_migrations(&pool).await.expect("run migrations");
        let db = Arc::new(pool);

        let (tx, rx) = mpsc::channel(1024);
        let event_task = tokio::spawn(events::process_events(rx));
        let event_sender = EventSender::new(tx);

        let services = AppServices::new(db.clone(), &cfg, event_sender.clone())
            .expect("wire services");
        let state = AppState {
            db: db.clone(),
            config: cfg.clone(),
            event_sender,
            services,
        };

        let auth_service = Arc::new(AuthService::new(AuthConfig::new(
            SECRET.to_string(),
            String::new(),
            String::new(),
        )));
        let router = build_router(state.clone(), auth_service);

        let queue = Arc::new(InMemoryMessageQueue::new());
        let relay = OutboxRelay::new((*db).clone(), queue.clone());

        Self {
            router,
            state,
            queue,
            relay,
            token: mint_token(&["admin"], &[]),
            _dir: dir,
            _event_task: event_task,
        }
    }

    /// Bearer token carrying the admin role.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request");

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        TestResponse { status, body }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Method::GET, uri, None, Some(self.token())).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.request(Method::POST, uri, Some(body), Some(self.token()))
            .await
    }

    pub async fn put(&self, uri: &str, body: Value) -> TestResponse {
        self.request(Method::PUT, uri, Some(body), Some(self.token()))
            .await
    }

    pub async fn delete(&self, uri: &str) -> TestResponse {
        self.request(Method::DELETE, uri, None, Some(self.token()))
            .await
    }

    pub async fn create_customer(&self, first: &str, last: &str) -> Uuid {
        let response = self
            .post(
                "/api/v1/customers",
                json!({ "firstName": first, "lastName": last }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.id()
    }

    pub async fn create_account(&self, customer_id: Uuid) -> Uuid {
        let response = self
            .post(
                "/api/v1/accounts",
                json!({ "iban": IBAN, "bicSwift": BIC, "customerId": customer_id }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.id()
    }

    pub async fn create_card(&self, account_id: Uuid, card_type: &str, pan: &str) -> Uuid {
        let response = self
            .post(
                "/api/v1/cards",
                json!({
                    "alias": format!("{} card", card_type.to_lowercase()),
                    "pan": pan,
                    "cvv": "123",
                    "type": card_type,
                    "accountId": account_id,
                }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.id()
    }

    /// Publishes every pending outbox row to the in-memory broker.
    pub async fn relay_outbox(&self) -> usize {
        self.relay.drain_once().await.expect("drain outbox")
    }

    /// Delivers everything currently waiting on `queue` to the cascade
    /// handlers and returns the outcomes.
    pub async fn consume(&self, queue: &str) -> Vec<Delivery> {
        let subscriptions = cascade_subscriptions(&self.state.services);
        let mut outcomes = Vec::new();
        while let Some(delivery) = subscriptions
            .consume_once(self.queue.as_ref() as &dyn MessageQueue, queue)
            .await
            .expect("consume message")
        {
            outcomes.push(delivery);
        }
        outcomes
    }

    /// Runs relay and both consumers until nothing is left in flight.
    pub async fn settle_cascade(&self) {
        loop {
            let published = self.relay_outbox().await;
            let customers = self
                .consume(events::CUSTOMER_DELETED_BINDING.queue)
                .await;
            let accounts = self.consume(events::ACCOUNT_DELETED_BINDING.queue).await;
            if published == 0 && customers.is_empty() && accounts.is_empty() {
                break;
            }
        }
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Mints an HS256 token signed with the test secret.
pub fn mint_token(roles: &[&str], permissions: &[&str]) -> String {
    let claims = Claims {
        sub: Uuid::new_v4().to_string(),
        name: Some("test user".to_string()),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        scope: None,
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        iat: Some(chrono::Utc::now().timestamp()),
        iss: None,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("encode test token")
}
