use crate::{
    clients::{AccountsApi, CallContext},
    db::{filters, DbPool, PageRequest, PageResponse},
    entities::customer,
    errors::{EntityKind, ServiceError},
    events::{outbox, CustomerDeleted, Event, EventSender},
    services::accounts::{AccountFilter, AccountResponse, NewAccountRequest},
    validation::validate_not_blank,
};
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Create and replace body for a customer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRequest {
    #[validate(custom = "validate_not_blank")]
    pub first_name: String,
    #[validate(custom = "validate_not_blank")]
    pub last_name: String,
    #[serde(default)]
    pub other_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerFilter {
    /// Free text over first, last and other name.
    pub name: Option<String>,
    pub start_date_created: Option<NaiveDate>,
    pub end_date_created: Option<NaiveDate>,
}

impl CustomerFilter {
    fn dates(&self) -> filters::DateRange {
        filters::DateRange {
            start_date_created: self.start_date_created,
            end_date_created: self.end_date_created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerResponse {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub other_name: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_last_modified: DateTime<Utc>,
}

impl From<customer::Model> for CustomerResponse {
    fn from(model: customer::Model) -> Self {
        Self {
            id: model.id,
            first_name: model.first_name,
            last_name: model.last_name,
            other_name: model.other_name,
            date_created: model.date_created,
            date_last_modified: model.date_last_modified,
        }
    }
}

fn sort_column(field: &str) -> Option<customer::Column> {
    match field {
        "firstName" => Some(customer::Column::FirstName),
        "lastName" => Some(customer::Column::LastName),
        "otherName" => Some(customer::Column::OtherName),
        "dateCreated" => Some(customer::Column::DateCreated),
        "dateLastModified" => Some(customer::Column::DateLastModified),
        _ => None,
    }
}

fn other_name(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Service for managing customers
#[derive(Clone)]
pub struct CustomerService {
    db: Arc<DbPool>,
    accounts: Arc<dyn AccountsApi>,
    event_sender: EventSender,
}

impl CustomerService {
    pub fn new(db: Arc<DbPool>, accounts: Arc<dyn AccountsApi>, event_sender: EventSender) -> Self {
        Self {
            db,
            accounts,
            event_sender,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn create_customer(
        &self,
        request: CustomerRequest,
    ) -> Result<customer::Model, ServiceError> {
        request.validate()?;

        let now = Utc::now();
        let created = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            first_name: Set(request.first_name.trim().to_string()),
            last_name: Set(request.last_name.trim().to_string()),
            other_name: Set(other_name(request.other_name)),
            date_created: Set(now),
            date_last_modified: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(customer_id = %created.id, "Customer created");
        self.event_sender.notify(Event::CustomerCreated(created.id));
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_customer(&self, id: Uuid) -> Result<customer::Model, ServiceError> {
        customer::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::NotFound(EntityKind::Customer))
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool, ServiceError> {
        customer_exists(&self.db, id).await
    }

    /// Replaces the three name fields; an omitted other name is cleared.
    #[instrument(skip(self, request))]
    pub async fn update_customer(
        &self,
        id: Uuid,
        request: CustomerRequest,
    ) -> Result<customer::Model, ServiceError> {
        request.validate()?;
        let existing = self.get_customer(id).await?;

        let mut active: customer::ActiveModel = existing.into();
        active.first_name = Set(request.first_name.trim().to_string());
        active.last_name = Set(request.last_name.trim().to_string());
        active.other_name = Set(other_name(request.other_name));
        active.date_last_modified = Set(Utc::now());

        let updated = active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        info!(customer_id = %id, "Customer updated");
        self.event_sender.notify(Event::CustomerUpdated(id));
        Ok(updated)
    }

    /// Deletes the customer and queues `CustomerDeleted` in one
    /// transaction. Accounts go asynchronously once the event is consumed.
    #[instrument(skip(self))]
    pub async fn delete_customer(&self, id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let result = customer::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Err(ServiceError::NotFound(EntityKind::Customer));
        }

        outbox::enqueue(&txn, &CustomerDeleted { customer_id: id }).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(customer_id = %id, "Customer deleted");
        self.event_sender.notify(Event::CustomerDeleted(id));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_customers(
        &self,
        filter: &CustomerFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<customer::Model>, ServiceError> {
        let orders = page
            .sort_orders(sort_column)
            .map_err(|f| ServiceError::field("sort", format!("cannot sort by '{}'", f)))?;

        let db = &*self.db;
        let select = customer::Entity::find()
            .filter(filter.dates().condition(customer::Column::DateCreated));
        let select = filters::apply_full_text(
            select,
            db.get_database_backend(),
            filter.name.as_deref(),
            &[
                customer::Column::FirstName,
                customer::Column::LastName,
                customer::Column::OtherName,
            ],
        );

        filters::fetch_page(
            db,
            select,
            orders,
            &[customer::Column::DateCreated, customer::Column::Id],
            page,
        )
        .await
        .map_err(ServiceError::db_error)
    }

    /// `POST /customers/{customerId}/accounts`: checks the customer here and
    /// hands the account to the account service.
    #[instrument(skip(self, ctx, request))]
    pub async fn create_account_for_customer(
        &self,
        ctx: &CallContext,
        customer_id: Uuid,
        request: NewAccountRequest,
    ) -> Result<AccountResponse, ServiceError> {
        request.validate()?;
        self.get_customer(customer_id).await?;
        self.accounts
            .create_account(ctx, &request.for_customer(customer_id))
            .await
    }

    #[instrument(skip(self, ctx, filter, page))]
    pub async fn list_accounts_for_customer(
        &self,
        ctx: &CallContext,
        customer_id: Uuid,
        mut filter: AccountFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<AccountResponse>, ServiceError> {
        self.get_customer(customer_id).await?;
        filter.customer_id = Some(customer_id);
        self.accounts.list_accounts(ctx, &filter, page).await
    }
}

/// Existence probe against the customer store.
pub(crate) async fn customer_exists(db: &DbPool, id: Uuid) -> Result<bool, ServiceError> {
    let count = customer::Entity::find_by_id(id)
        .count(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(count > 0)
}
