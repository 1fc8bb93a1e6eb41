use crate::{
    clients::{CallContext, CardsApi, CustomerLookup},
    db::{filters, DbPool, PageRequest, PageResponse},
    entities::account,
    errors::{EntityKind, ServiceError},
    events::{outbox, AccountDeleted, Event, EventSender},
    services::cards::{CardFilter, CardResponse, NewCardRequest},
    validation::{validate_bic_swift, validate_iban},
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    #[validate(custom = "validate_iban")]
    pub iban: String,
    #[validate(custom = "validate_bic_swift")]
    pub bic_swift: String,
    pub customer_id: Uuid,
}

/// Body of `POST /customers/{customerId}/accounts`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountRequest {
    #[validate(custom = "validate_iban")]
    pub iban: String,
    #[validate(custom = "validate_bic_swift")]
    pub bic_swift: String,
}

impl NewAccountRequest {
    pub fn for_customer(self, customer_id: Uuid) -> CreateAccountRequest {
        CreateAccountRequest {
            iban: self.iban,
            bic_swift: self.bic_swift,
            customer_id,
        }
    }
}

/// The owning customer is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    #[validate(custom = "validate_iban")]
    pub iban: String,
    #[validate(custom = "validate_bic_swift")]
    pub bic_swift: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iban: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bic_swift: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_created: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date_created: Option<NaiveDate>,
}

impl AccountFilter {
    fn condition(&self) -> Condition {
        let dates = filters::DateRange {
            start_date_created: self.start_date_created,
            end_date_created: self.end_date_created,
        };
        let mut condition = Condition::all()
            .add(filters::eq_if_present(account::Column::Iban, &self.iban))
            .add(filters::eq_if_present(
                account::Column::BicSwift,
                &self.bic_swift,
            ))
            .add(dates.condition(account::Column::DateCreated));
        if let Some(customer_id) = self.customer_id {
            condition = condition.add(account::Column::CustomerId.eq(customer_id));
        }
        condition
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub id: Uuid,
    pub iban: String,
    pub bic_swift: String,
    pub customer_id: Uuid,
    pub date_created: DateTime<Utc>,
    pub date_last_modified: DateTime<Utc>,
}

impl From<account::Model> for AccountResponse {
    fn from(model: account::Model) -> Self {
        Self {
            id: model.id,
            iban: model.iban,
            bic_swift: model.bic_swift,
            customer_id: model.customer_id,
            date_created: model.date_created,
            date_last_modified: model.date_last_modified,
        }
    }
}

fn sort_column(field: &str) -> Option<account::Column> {
    match field {
        "iban" => Some(account::Column::Iban),
        "bicSwift" => Some(account::Column::BicSwift),
        "customerId" => Some(account::Column::CustomerId),
        "dateCreated" => Some(account::Column::DateCreated),
        "dateLastModified" => Some(account::Column::DateLastModified),
        _ => None,
    }
}

/// Service for managing accounts
#[derive(Clone)]
pub struct AccountService {
    db: Arc<DbPool>,
    customers: Arc<dyn CustomerLookup>,
    cards: Arc<dyn CardsApi>,
    event_sender: EventSender,
}

impl AccountService {
    pub fn new(
        db: Arc<DbPool>,
        customers: Arc<dyn CustomerLookup>,
        cards: Arc<dyn CardsApi>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            customers,
            cards,
            event_sender,
        }
    }

    /// Creates an account for an existing customer.
    #[instrument(skip(self, ctx, request), fields(customer_id = %request.customer_id))]
    pub async fn create_account(
        &self,
        ctx: &CallContext,
        request: CreateAccountRequest,
    ) -> Result<account::Model, ServiceError> {
        request.validate()?;

        if !self
            .customers
            .customer_exists(ctx, request.customer_id)
            .await?
        {
            return Err(ServiceError::NotFound(EntityKind::Customer));
        }

        let now = Utc::now();
        let created = account::ActiveModel {
            id: Set(Uuid::new_v4()),
            iban: Set(request.iban),
            bic_swift: Set(request.bic_swift),
            customer_id: Set(request.customer_id),
            date_created: Set(now),
            date_last_modified: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(account_id = %created.id, "Account created");
        self.event_sender.notify(Event::AccountCreated(created.id));
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_account(&self, id: Uuid) -> Result<account::Model, ServiceError> {
        account::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::NotFound(EntityKind::Account))
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool, ServiceError> {
        account_exists(&self.db, id).await
    }

    /// Replaces IBAN and BIC/SWIFT.
    #[instrument(skip(self, request))]
    pub async fn update_account(
        &self,
        id: Uuid,
        request: UpdateAccountRequest,
    ) -> Result<account::Model, ServiceError> {
        request.validate()?;
        let existing = self.get_account(id).await?;

        let mut active: account::ActiveModel = existing.into();
        active.iban = Set(request.iban);
        active.bic_swift = Set(request.bic_swift);
        active.date_last_modified = Set(Utc::now());

        let updated = active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        info!(account_id = %id, "Account updated");
        self.event_sender.notify(Event::AccountUpdated(id));
        Ok(updated)
    }

    /// API delete: 404 for an unknown account, otherwise the row goes and
    /// an `AccountDeleted` event is queued in the same transaction.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: Uuid) -> Result<(), ServiceError> {
        if self.delete_with_event(id).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(EntityKind::Account))
        }
    }

    /// Returns false, without publishing anything, when `id` is already gone.
    async fn delete_with_event(&self, id: Uuid) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let result = account::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Ok(false);
        }

        outbox::enqueue(&txn, &AccountDeleted { account_id: id }).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(account_id = %id, "Account deleted");
        self.event_sender.notify(Event::AccountDeleted(id));
        Ok(true)
    }

    /// Event path for `CustomerDeleted`: deletes every account of the
    /// customer, each one queueing its own `AccountDeleted`. Safe to run
    /// again; accounts already gone are skipped.
    #[instrument(skip(self))]
    pub async fn delete_accounts_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<usize, ServiceError> {
        let ids: Vec<Uuid> = account::Entity::find()
            .select_only()
            .column(account::Column::Id)
            .filter(account::Column::CustomerId.eq(customer_id))
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut deleted = 0;
        for id in ids {
            if self.delete_with_event(id).await? {
                deleted += 1;
            } else {
                warn!(account_id = %id, "Account vanished during cascade");
            }
        }
        if deleted > 0 {
            info!(%customer_id, deleted, "Cascade deleted accounts");
            counter!("dtbank_cascade.accounts_deleted", deleted as u64);
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    pub async fn list_accounts(
        &self,
        filter: &AccountFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<account::Model>, ServiceError> {
        let orders = page
            .sort_orders(sort_column)
            .map_err(|f| ServiceError::field("sort", format!("cannot sort by '{}'", f)))?;

        let select = account::Entity::find().filter(filter.condition());
        filters::fetch_page(
            &*self.db,
            select,
            orders,
            &[account::Column::DateCreated, account::Column::Id],
            page,
        )
        .await
        .map_err(ServiceError::db_error)
    }

    /// `POST /accounts/{accountId}/cards`: the account is checked here,
    /// then the card service does the rest.
    #[instrument(skip(self, ctx, request))]
    pub async fn create_card_for_account(
        &self,
        ctx: &CallContext,
        account_id: Uuid,
        request: NewCardRequest,
    ) -> Result<CardResponse, ServiceError> {
        request.validate()?;
        self.get_account(account_id).await?;
        self.cards
            .create_card(ctx, &request.for_account(account_id))
            .await
    }

    #[instrument(skip(self, ctx, filter, page))]
    pub async fn list_cards_for_account(
        &self,
        ctx: &CallContext,
        account_id: Uuid,
        mut filter: CardFilter,
        page: &PageRequest,
        unmask: bool,
    ) -> Result<PageResponse<CardResponse>, ServiceError> {
        self.get_account(account_id).await?;
        filter.account_id = Some(account_id);
        self.cards.list_cards(ctx, &filter, page, unmask).await
    }
}

/// Existence probe against the account store.
pub(crate) async fn account_exists(db: &DbPool, id: Uuid) -> Result<bool, ServiceError> {
    let count = account::Entity::find_by_id(id)
        .count(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DE89370400440532013000", "DEUTDEFF", true)]
    #[case("DE89370400440532013000", "DEUTDEFF500", true)]
    #[case("de89370400440532013000", "DEUTDEFF", false)]
    #[case("DE89370400440532013000", "DEUT", false)]
    fn create_request_validation(#[case] iban: &str, #[case] bic: &str, #[case] ok: bool) {
        let request = CreateAccountRequest {
            iban: iban.into(),
            bic_swift: bic.into(),
            customer_id: Uuid::new_v4(),
        };
        assert_eq!(request.validate().is_ok(), ok);
    }

    #[test]
    fn invalid_bic_is_reported_under_wire_name() {
        let request = UpdateAccountRequest {
            iban: "DE89370400440532013000".into(),
            bic_swift: "nope".into(),
        };
        let err: ServiceError = request.validate().unwrap_err().into();
        let ServiceError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert!(fields.contains_key("bicSwift"));
    }

    #[test]
    fn nested_body_takes_customer_from_path() {
        let customer_id = Uuid::new_v4();
        let request = NewAccountRequest {
            iban: "DE89370400440532013000".into(),
            bic_swift: "DEUTDEFF".into(),
        }
        .for_customer(customer_id);
        assert_eq!(request.customer_id, customer_id);
    }

    #[test]
    fn filter_serializes_only_present_fields() {
        let filter = AccountFilter {
            iban: Some("DE89370400440532013000".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({ "iban": "DE89370400440532013000" }));
    }
}
