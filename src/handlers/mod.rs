pub mod accounts;
pub mod cards;
pub mod common;
pub mod customers;

use crate::{
    circuit_breaker::CircuitBreakerConfig,
    clients::{
        AccountLookup, AccountsApi, CardsApi, CustomerLookup, LocalAccountLookup,
        LocalAccountsApi, LocalCardsApi, LocalCustomerLookup, SiblingClient,
    },
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{AccountService, CardService, CustomerService},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub customers: Arc<CustomerService>,
    pub accounts: Arc<AccountService>,
    pub cards: Arc<CardService>,
    /// Whether accounts are owned by this process (no remote account service).
    pub hosts_accounts: bool,
    /// Whether cards are owned by this process (no remote card service).
    pub hosts_cards: bool,
}

impl AppServices {
    /// Wires the three services together. A configured sibling URL swaps
    /// the in-process seam for an HTTP client.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let breaker = CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
            success_threshold: 1,
        };
        let sibling = |name: &str, url: &str| -> Result<Arc<SiblingClient>, ServiceError> {
            info!(service = name, url, "Using remote sibling service");
            SiblingClient::new(name, url, config.sibling_timeout(), breaker.clone()).map(Arc::new)
        };

        let remote_customers = config
            .customer_service_url
            .as_deref()
            .map(|url| sibling("customer-service", url))
            .transpose()?;
        let remote_accounts = config
            .account_service_url
            .as_deref()
            .map(|url| sibling("account-service", url))
            .transpose()?;
        let remote_cards = config
            .card_service_url
            .as_deref()
            .map(|url| sibling("card-service", url))
            .transpose()?;

        let account_lookup: Arc<dyn AccountLookup> = match &remote_accounts {
            Some(client) => client.clone(),
            None => Arc::new(LocalAccountLookup::new(db_pool.clone())),
        };
        let cards = Arc::new(CardService::new(
            db_pool.clone(),
            account_lookup,
            event_sender.clone(),
            config.pan_luhn_check,
        ));

        let customer_lookup: Arc<dyn CustomerLookup> = match &remote_customers {
            Some(client) => client.clone(),
            None => Arc::new(LocalCustomerLookup::new(db_pool.clone())),
        };
        let cards_api: Arc<dyn CardsApi> = match &remote_cards {
            Some(client) => client.clone(),
            None => Arc::new(LocalCardsApi::new(cards.clone())),
        };
        let accounts = Arc::new(AccountService::new(
            db_pool.clone(),
            customer_lookup,
            cards_api,
            event_sender.clone(),
        ));

        let accounts_api: Arc<dyn AccountsApi> = match &remote_accounts {
            Some(client) => client.clone(),
            None => Arc::new(LocalAccountsApi::new(accounts.clone())),
        };
        let customers = Arc::new(CustomerService::new(db_pool, accounts_api, event_sender));

        Ok(Self {
            customers,
            accounts,
            cards,
            hosts_accounts: remote_accounts.is_none(),
            hosts_cards: remote_cards.is_none(),
        })
    }
}
