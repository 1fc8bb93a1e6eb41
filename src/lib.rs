//! DT Bank API Library
//!
//! Customer, account and card services with an event-driven deletion
//! cascade: deleting a customer removes its accounts, deleting an account
//! removes its cards.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod circuit_breaker;
pub mod clients;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod message_queue;
pub mod middleware_helpers;
pub mod migrator;
pub mod services;
pub mod tracing;
pub mod validation;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::auth::consts as perm;
use crate::auth::{AuthRouterExt, AuthService};
use crate::events::consumers::Subscriptions;
use crate::events::{AccountDeleted, CustomerDeleted};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

/// Versioned API routes, each group gated by its permission.
pub fn api_v1_routes() -> Router<AppState> {
    // Customers
    let customers_read = Router::new()
        .route("/customers", get(handlers::customers::list_customers))
        .route("/customers/:id", get(handlers::customers::get_customer))
        .with_permission(perm::CUSTOMER_READ);

    let customers_create = Router::new()
        .route("/customers", post(handlers::customers::create_customer))
        .with_permission(perm::CUSTOMER_CREATE);

    let customers_update = Router::new()
        .route("/customers/:id", put(handlers::customers::update_customer))
        .with_permission(perm::CUSTOMER_UPDATE);

    let customers_delete = Router::new()
        .route("/customers/:id", delete(handlers::customers::delete_customer))
        .with_permission(perm::CUSTOMER_DELETE);

    // Accounts
    let accounts_read = Router::new()
        .route("/accounts", get(handlers::accounts::list_accounts))
        .route("/accounts/:id", get(handlers::accounts::get_account))
        .route(
            "/customers/:id/accounts",
            get(handlers::customers::list_customer_accounts),
        )
        .with_permission(perm::ACCOUNT_READ);

    let accounts_create = Router::new()
        .route("/accounts", post(handlers::accounts::create_account))
        .route(
            "/customers/:id/accounts",
            post(handlers::customers::create_customer_account),
        )
        .with_permission(perm::ACCOUNT_CREATE);

    let accounts_update = Router::new()
        .route("/accounts/:id", put(handlers::accounts::update_account))
        .with_permission(perm::ACCOUNT_UPDATE);

    let accounts_delete = Router::new()
        .route("/accounts/:id", delete(handlers::accounts::delete_account))
        .with_permission(perm::ACCOUNT_DELETE);

    // Cards
    let cards_read = Router::new()
        .route("/cards", get(handlers::cards::list_cards))
        .route("/cards/:id", get(handlers::cards::get_card))
        .route(
            "/accounts/:id/cards",
            get(handlers::accounts::list_account_cards),
        )
        .with_permission(perm::CARD_READ);

    let cards_create = Router::new()
        .route("/cards", post(handlers::cards::create_card))
        .route(
            "/accounts/:id/cards",
            post(handlers::accounts::create_account_card),
        )
        .with_permission(perm::CARD_CREATE);

    let cards_update = Router::new()
        .route("/cards/:id", put(handlers::cards::update_card))
        .with_permission(perm::CARD_UPDATE);

    let cards_delete = Router::new()
        .route("/cards/:id", delete(handlers::cards::delete_card))
        .with_permission(perm::CARD_DELETE);

    Router::new()
        .merge(customers_read)
        .merge(customers_create)
        .merge(customers_update)
        .merge(customers_delete)
        .merge(accounts_read)
        .merge(accounts_create)
        .merge(accounts_update)
        .merge(accounts_delete)
        .merge(cards_read)
        .merge(cards_create)
        .merge(cards_update)
        .merge(cards_delete)
}

/// Full application router: `/api/v1` behind auth, `/health` open, plus
/// request-id, auth-service injection and HTTP tracing layers.
pub fn build_router(state: AppState, auth_service: Arc<AuthService>) -> Router {
    let db = state.db.clone();
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
        .nest("/health", health::health_routes(db))
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        // Inject AuthService into request extensions for auth middleware
        .layer(axum::middleware::from_fn_with_state(
            auth_service,
            auth::inject_auth_service,
        ))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
}

/// Queue handlers for the deletion cascade. Only services owned by this
/// process consume; a remote sibling consumes its own queue.
pub fn cascade_subscriptions(services: &handlers::AppServices) -> Subscriptions {
    let mut subscriptions = Subscriptions::new();

    if services.hosts_accounts {
        let accounts = services.accounts.clone();
        subscriptions = subscriptions.on(move |event: CustomerDeleted| {
            let accounts = accounts.clone();
            async move {
                accounts
                    .delete_accounts_for_customer(event.customer_id)
                    .await
                    .map(|_| ())
            }
        });
    }

    if services.hosts_cards {
        let cards = services.cards.clone();
        subscriptions = subscriptions.on(move |event: AccountDeleted| {
            let cards = cards.clone();
            async move {
                cards
                    .delete_cards_for_account(event.account_id)
                    .await
                    .map(|_| ())
            }
        });
    }

    subscriptions
}

pub mod prelude {
    pub use crate::auth::AuthUser;
    pub use crate::db::{PageRequest, PageResponse};
    pub use crate::errors::ServiceError;
    pub use crate::services::{AccountService, CardService, CustomerService};
    pub use crate::AppState;
}
