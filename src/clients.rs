//! Seams between the three services. Each service only reaches another
//! service's data through one of these traits; the local implementations
//! call straight into the sibling service in this process, the HTTP ones go
//! over the wire with the caller's credentials.

use crate::{
    auth::AuthUser,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
    db::{DbPool, PageRequest, PageResponse},
    errors::ServiceError,
    middleware_helpers::request_id::REQUEST_ID_HEADER,
    services::{
        accounts::{self, AccountFilter, AccountResponse, AccountService, CreateAccountRequest},
        cards::{CardFilter, CardResponse, CardService, CreateCardRequest},
        customers,
    },
};
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Caller identity carried across service boundaries.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Full `Authorization` header value.
    pub authorization: Option<String>,
    pub request_id: Option<String>,
}

impl CallContext {
    pub fn for_user(user: &AuthUser) -> Self {
        Self {
            authorization: Some(user.bearer()),
            request_id: crate::tracing::current_request_id().map(|r| r.as_str().to_string()),
        }
    }
}

#[async_trait]
pub trait CustomerLookup: Send + Sync {
    async fn customer_exists(&self, ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait AccountLookup: Send + Sync {
    async fn account_exists(&self, ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait AccountsApi: Send + Sync {
    async fn create_account(
        &self,
        ctx: &CallContext,
        request: &CreateAccountRequest,
    ) -> Result<AccountResponse, ServiceError>;

    async fn list_accounts(
        &self,
        ctx: &CallContext,
        filter: &AccountFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<AccountResponse>, ServiceError>;
}

#[async_trait]
pub trait CardsApi: Send + Sync {
    /// The returned card is masked.
    async fn create_card(
        &self,
        ctx: &CallContext,
        request: &CreateCardRequest,
    ) -> Result<CardResponse, ServiceError>;

    async fn list_cards(
        &self,
        ctx: &CallContext,
        filter: &CardFilter,
        page: &PageRequest,
        unmask: bool,
    ) -> Result<PageResponse<CardResponse>, ServiceError>;
}

// In-process implementations

pub struct LocalCustomerLookup {
    db: Arc<DbPool>,
}

impl LocalCustomerLookup {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CustomerLookup for LocalCustomerLookup {
    async fn customer_exists(&self, _ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError> {
        customers::customer_exists(&self.db, id).await
    }
}

pub struct LocalAccountLookup {
    db: Arc<DbPool>,
}

impl LocalAccountLookup {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccountLookup for LocalAccountLookup {
    async fn account_exists(&self, _ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError> {
        accounts::account_exists(&self.db, id).await
    }
}

pub struct LocalAccountsApi {
    accounts: Arc<AccountService>,
}

impl LocalAccountsApi {
    pub fn new(accounts: Arc<AccountService>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountsApi for LocalAccountsApi {
    async fn create_account(
        &self,
        ctx: &CallContext,
        request: &CreateAccountRequest,
    ) -> Result<AccountResponse, ServiceError> {
        self.accounts
            .create_account(ctx, request.clone())
            .await
            .map(AccountResponse::from)
    }

    async fn list_accounts(
        &self,
        _ctx: &CallContext,
        filter: &AccountFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<AccountResponse>, ServiceError> {
        let found = self.accounts.list_accounts(filter, page).await?;
        Ok(found.map(AccountResponse::from))
    }
}

pub struct LocalCardsApi {
    cards: Arc<CardService>,
}

impl LocalCardsApi {
    pub fn new(cards: Arc<CardService>) -> Self {
        Self { cards }
    }
}

#[async_trait]
impl CardsApi for LocalCardsApi {
    async fn create_card(
        &self,
        ctx: &CallContext,
        request: &CreateCardRequest,
    ) -> Result<CardResponse, ServiceError> {
        self.cards
            .create_card(ctx, request.clone())
            .await
            .map(CardResponse::masked)
    }

    async fn list_cards(
        &self,
        _ctx: &CallContext,
        filter: &CardFilter,
        page: &PageRequest,
        unmask: bool,
    ) -> Result<PageResponse<CardResponse>, ServiceError> {
        let found = self.cards.list_cards(filter, page).await?;
        Ok(found.map(|card| CardResponse::from_model(card, unmask)))
    }
}

// HTTP implementations

enum CallFailure {
    Transport(reqwest::Error),
    ServerError { status: StatusCode, body: Option<Value> },
}

/// HTTP client for one sibling service, guarded by its own circuit breaker.
/// Transport errors and 5xx answers trip the breaker; 4xx answers do not.
#[derive(Clone)]
pub struct SiblingClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl SiblingClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Result<Self, ServiceError> {
        let name = name.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str, ctx: &CallContext) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(auth) = &ctx.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(request_id) = &ctx.request_id {
            builder = builder.header(REQUEST_ID_HEADER, request_id);
        }
        builder
    }

    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let outcome = self
            .breaker
            .call(|| async move {
                let response = builder.send().await.map_err(CallFailure::Transport)?;
                let status = response.status();
                if status.is_server_error() {
                    let body = response.json::<Value>().await.ok();
                    return Err(CallFailure::ServerError { status, body });
                }
                Ok(response)
            })
            .await;

        match outcome {
            Ok(response) => Ok(response),
            Err(CircuitBreakerError::CircuitOpen) => {
                warn!(service = %self.name, "Circuit open; call rejected");
                Err(ServiceError::CircuitBreakerOpen)
            }
            Err(CircuitBreakerError::ServiceFailure(CallFailure::Transport(e))) => {
                warn!(service = %self.name, error = %e, "Sibling service unreachable");
                Err(ServiceError::UpstreamUnavailable(format!("{}: {}", self.name, e)))
            }
            Err(CircuitBreakerError::ServiceFailure(CallFailure::ServerError { status, body })) => {
                warn!(service = %self.name, %status, "Sibling service failed");
                Err(ServiceError::Upstream { status, body })
            }
        }
    }

    /// 2xx -> true, 404 -> false, anything else is an error.
    async fn exists(&self, ctx: &CallContext, path: &str) -> Result<bool, ServiceError> {
        let response = self.execute(self.request(Method::GET, path, ctx)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => decode::<Value>(response).await.map(|_| false),
        }
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let response = self
            .execute(self.request(Method::POST, path, ctx).json(body))
            .await?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        path: &str,
        with_query: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send,
    ) -> Result<T, ServiceError> {
        let builder = with_query(self.request(Method::GET, path, ctx));
        let response = self.execute(builder).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::SerializationError(e.to_string()));
    }
    let body = response.json::<Value>().await.ok();
    debug!(%status, "Sibling service rejected the call");
    Err(ServiceError::Upstream { status, body })
}

#[derive(Serialize)]
struct Unmask {
    unmask: bool,
}

#[async_trait]
impl CustomerLookup for SiblingClient {
    async fn customer_exists(&self, ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError> {
        self.exists(ctx, &format!("/api/v1/customers/{}", id)).await
    }
}

#[async_trait]
impl AccountLookup for SiblingClient {
    async fn account_exists(&self, ctx: &CallContext, id: Uuid) -> Result<bool, ServiceError> {
        self.exists(ctx, &format!("/api/v1/accounts/{}", id)).await
    }
}

#[async_trait]
impl AccountsApi for SiblingClient {
    async fn create_account(
        &self,
        ctx: &CallContext,
        request: &CreateAccountRequest,
    ) -> Result<AccountResponse, ServiceError> {
        self.post(ctx, "/api/v1/accounts", request).await
    }

    async fn list_accounts(
        &self,
        ctx: &CallContext,
        filter: &AccountFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<AccountResponse>, ServiceError> {
        self.get(ctx, "/api/v1/accounts", |b| b.query(filter).query(page))
            .await
    }
}

#[async_trait]
impl CardsApi for SiblingClient {
    async fn create_card(
        &self,
        ctx: &CallContext,
        request: &CreateCardRequest,
    ) -> Result<CardResponse, ServiceError> {
        self.post(ctx, "/api/v1/cards", request).await
    }

    async fn list_cards(
        &self,
        ctx: &CallContext,
        filter: &CardFilter,
        page: &PageRequest,
        unmask: bool,
    ) -> Result<PageResponse<CardResponse>, ServiceError> {
        self.get(ctx, "/api/v1/cards", |b| {
            b.query(filter).query(page).query(&Unmask { unmask })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::entities::CardType;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, failure_threshold: u32) -> SiblingClient {
        SiblingClient::new(
            "test-sibling",
            server.uri(),
            Duration::from_secs(2),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        )
        .unwrap()
    }

    fn ctx() -> CallContext {
        CallContext {
            authorization: Some("Bearer abc".into()),
            request_id: Some("req-1".into()),
        }
    }

    #[tokio::test]
    async fn existence_maps_404_to_false_and_forwards_credentials() {
        let server = MockServer::start().await;
        let present = Uuid::new_v4();
        let absent = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/customers/{}", present)))
            .and(header("authorization", "Bearer abc"))
            .and(header(REQUEST_ID_HEADER, "req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": present })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/customers/{}", absent)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server, 5);
        assert!(client.customer_exists(&ctx(), present).await.unwrap());
        assert!(!client.customer_exists(&ctx(), absent).await.unwrap());
    }

    #[tokio::test]
    async fn sibling_error_body_is_carried_through() {
        let server = MockServer::start().await;
        let body = json!({ "errorCode": "CARD_TYPE_ALREADY_EXISTS", "timestamp": "t" });
        Mock::given(method("POST"))
            .and(path("/api/v1/cards"))
            .respond_with(ResponseTemplate::new(409).set_body_json(body.clone()))
            .mount(&server)
            .await;

        let request = CreateCardRequest {
            alias: "Travel".into(),
            pan: "4111111111111111".into(),
            cvv: "123".into(),
            card_type: CardType::Debit,
            account_id: Uuid::new_v4(),
        };
        let err = client(&server, 5)
            .create_card(&ctx(), &request)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Upstream { status, body: Some(b) } => {
            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(b, body);
        });
    }

    #[tokio::test]
    async fn list_cards_sends_filter_page_and_unmask() {
        let server = MockServer::start().await;
        let account_id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/api/v1/cards"))
            .and(query_param("accountId", account_id.to_string()))
            .and(query_param("size", "5"))
            .and(query_param("unmask", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [],
                "page": { "size": 5, "number": 0, "totalElements": 0, "totalPages": 0 }
            })))
            .mount(&server)
            .await;

        let filter = CardFilter {
            account_id: Some(account_id),
            ..Default::default()
        };
        let page = PageRequest {
            size: Some(5),
            ..Default::default()
        };
        let found = client(&server, 5)
            .list_cards(&ctx(), &filter, &page, true)
            .await
            .unwrap();
        assert!(found.content.is_empty());
        assert_eq!(found.page.size, 5);
    }

    #[tokio::test]
    async fn server_errors_open_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client(&server, 2);
        let id = Uuid::new_v4();
        for _ in 0..2 {
            assert_matches!(
                client.account_exists(&ctx(), id).await,
                Err(ServiceError::Upstream { .. })
            );
        }
        assert_eq!(client.breaker.state(), CircuitState::Open);
        assert_matches!(
            client.account_exists(&ctx(), id).await,
            Err(ServiceError::CircuitBreakerOpen)
        );
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errorCode": "VALIDATION_ERROR"
            })))
            .mount(&server)
            .await;

        let client = client(&server, 1);
        let request = CreateAccountRequest {
            iban: "DE89370400440532013000".into(),
            bic_swift: "DEUTDEFF".into(),
            customer_id: Uuid::new_v4(),
        };
        for _ in 0..3 {
            assert_matches!(
                client.create_account(&ctx(), &request).await,
                Err(ServiceError::Upstream { status, .. }) if status == StatusCode::BAD_REQUEST
            );
        }
        assert_eq!(client.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn unreachable_sibling_is_reported() {
        let client = SiblingClient::new(
            "gone",
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            CircuitBreakerConfig::default(),
        )
        .unwrap();
        assert_matches!(
            client.customer_exists(&ctx(), Uuid::new_v4()).await,
            Err(ServiceError::UpstreamUnavailable(_))
        );
    }
}
