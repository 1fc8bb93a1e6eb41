use crate::{
    clients::{AccountLookup, CallContext},
    db::{filters, DbPool, PageRequest, PageResponse},
    entities::card::{self, CardType},
    errors::{EntityKind, ServiceError},
    events::{Event, EventSender},
    validation::{luhn_valid, normalize_pan, validate_cvv, validate_not_blank, validate_pan},
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// What a masked PAN looks like on the wire.
pub const MASKED_PAN: &str = "*************";
/// What a masked CVV looks like on the wire.
pub const MASKED_CVV: &str = "***";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardRequest {
    #[validate(custom = "validate_not_blank")]
    pub alias: String,
    #[validate(custom = "validate_pan")]
    pub pan: String,
    #[validate(custom = "validate_cvv")]
    pub cvv: String,
    #[serde(rename = "type")]
    pub card_type: CardType,
    pub account_id: Uuid,
}

/// Body of `POST /accounts/{accountId}/cards`; the account comes from the path.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewCardRequest {
    #[validate(custom = "validate_not_blank")]
    pub alias: String,
    #[validate(custom = "validate_pan")]
    pub pan: String,
    #[validate(custom = "validate_cvv")]
    pub cvv: String,
    #[serde(rename = "type")]
    pub card_type: CardType,
}

impl NewCardRequest {
    pub fn for_account(self, account_id: Uuid) -> CreateCardRequest {
        CreateCardRequest {
            alias: self.alias,
            pan: self.pan,
            cvv: self.cvv,
            card_type: self.card_type,
            account_id,
        }
    }
}

/// Type and account are fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCardRequest {
    #[validate(custom = "validate_not_blank")]
    pub alias: String,
    #[validate(custom = "validate_pan")]
    pub pan: String,
    #[validate(custom = "validate_cvv")]
    pub cvv: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    /// Free text over the alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub card_type: Option<CardType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_created: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date_created: Option<NaiveDate>,
}

impl CardFilter {
    fn condition(&self) -> Condition {
        let dates = filters::DateRange {
            start_date_created: self.start_date_created,
            end_date_created: self.end_date_created,
        };
        let mut condition = Condition::all()
            .add(filters::eq_if_present(
                card::Column::Pan,
                &self.pan.as_deref().map(normalize_pan),
            ))
            .add(dates.condition(card::Column::DateCreated));
        if let Some(account_id) = self.account_id {
            condition = condition.add(card::Column::AccountId.eq(account_id));
        }
        if let Some(card_type) = self.card_type {
            condition = condition.add(card::Column::CardType.eq(card_type));
        }
        condition
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardResponse {
    pub id: Uuid,
    pub alias: String,
    pub pan: String,
    pub cvv: String,
    #[serde(rename = "type")]
    pub card_type: CardType,
    pub account_id: Uuid,
    pub date_created: chrono::DateTime<Utc>,
    pub date_last_modified: chrono::DateTime<Utc>,
}

impl CardResponse {
    /// Builds the wire view; PAN and CVV are masked unless `unmask` is set.
    pub fn from_model(model: card::Model, unmask: bool) -> Self {
        let (pan, cvv) = if unmask {
            (model.pan, model.cvv)
        } else {
            (MASKED_PAN.to_string(), MASKED_CVV.to_string())
        };
        Self {
            id: model.id,
            alias: model.alias,
            pan,
            cvv,
            card_type: model.card_type,
            account_id: model.account_id,
            date_created: model.date_created,
            date_last_modified: model.date_last_modified,
        }
    }

    pub fn masked(model: card::Model) -> Self {
        Self::from_model(model, false)
    }
}

fn sort_column(field: &str) -> Option<card::Column> {
    match field {
        "alias" => Some(card::Column::Alias),
        "type" => Some(card::Column::CardType),
        "accountId" => Some(card::Column::AccountId),
        "dateCreated" => Some(card::Column::DateCreated),
        "dateLastModified" => Some(card::Column::DateLastModified),
        _ => None,
    }
}

/// Service for managing cards
#[derive(Clone)]
pub struct CardService {
    db: Arc<DbPool>,
    accounts: Arc<dyn AccountLookup>,
    event_sender: EventSender,
    luhn_check: bool,
}

impl CardService {
    pub fn new(
        db: Arc<DbPool>,
        accounts: Arc<dyn AccountLookup>,
        event_sender: EventSender,
        luhn_check: bool,
    ) -> Self {
        Self {
            db,
            accounts,
            event_sender,
            luhn_check,
        }
    }

    /// Normalized PAN, rejecting bad checksums when the check is enabled.
    fn checked_pan(&self, pan: &str) -> Result<String, ServiceError> {
        let pan = normalize_pan(pan);
        if self.luhn_check && !luhn_valid(&pan) {
            return Err(ServiceError::field("pan", "must pass the Luhn checksum"));
        }
        Ok(pan)
    }

    /// Creates a card after checking that the account exists and holds no
    /// card of the same type.
    #[instrument(skip(self, ctx, request), fields(account_id = %request.account_id))]
    pub async fn create_card(
        &self,
        ctx: &CallContext,
        request: CreateCardRequest,
    ) -> Result<card::Model, ServiceError> {
        request.validate()?;
        let pan = self.checked_pan(&request.pan)?;

        if !self.accounts.account_exists(ctx, request.account_id).await? {
            return Err(ServiceError::NotFound(EntityKind::Account));
        }

        let db = &*self.db;
        let duplicate = card::Entity::find()
            .filter(card::Column::AccountId.eq(request.account_id))
            .filter(card::Column::CardType.eq(request.card_type))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if duplicate.is_some() {
            return Err(ServiceError::CardTypeAlreadyExists);
        }

        let now = Utc::now();
        let created = card::ActiveModel {
            id: Set(Uuid::new_v4()),
            alias: Set(request.alias.trim().to_string()),
            pan: Set(pan),
            cvv: Set(request.cvv),
            card_type: Set(request.card_type),
            account_id: Set(request.account_id),
            date_created: Set(now),
            date_last_modified: Set(now),
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(card_id = %created.id, card_type = %created.card_type, "Card created");
        self.event_sender.notify(Event::CardCreated(created.id));
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_card(&self, id: Uuid) -> Result<card::Model, ServiceError> {
        card::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::NotFound(EntityKind::Card))
    }

    /// Replaces alias, PAN and CVV.
    #[instrument(skip(self, request))]
    pub async fn update_card(
        &self,
        id: Uuid,
        request: UpdateCardRequest,
    ) -> Result<card::Model, ServiceError> {
        request.validate()?;
        let pan = self.checked_pan(&request.pan)?;
        let existing = self.get_card(id).await?;

        let mut active: card::ActiveModel = existing.into();
        active.alias = Set(request.alias.trim().to_string());
        active.pan = Set(pan);
        active.cvv = Set(request.cvv);
        active.date_last_modified = Set(Utc::now());

        let updated = active
            .update(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        info!(card_id = %id, "Card updated");
        self.event_sender.notify(Event::CardUpdated(id));
        Ok(updated)
    }

    /// API delete: a missing card is an error.
    #[instrument(skip(self))]
    pub async fn delete_card(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = card::Entity::delete_by_id(id)
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(EntityKind::Card));
        }
        info!(card_id = %id, "Card deleted");
        self.event_sender.notify(Event::CardDeleted(id));
        Ok(())
    }

    /// Event path: removes every card of `account_id`. Running it again
    /// after the cards are gone deletes nothing and succeeds.
    #[instrument(skip(self))]
    pub async fn delete_cards_for_account(&self, account_id: Uuid) -> Result<u64, ServiceError> {
        let result = card::Entity::delete_many()
            .filter(card::Column::AccountId.eq(account_id))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected > 0 {
            info!(%account_id, deleted = result.rows_affected, "Cascade deleted cards");
            counter!("dtbank_cascade.cards_deleted", result.rows_affected);
        }
        Ok(result.rows_affected)
    }

    #[instrument(skip(self))]
    pub async fn list_cards(
        &self,
        filter: &CardFilter,
        page: &PageRequest,
    ) -> Result<PageResponse<card::Model>, ServiceError> {
        let orders = page
            .sort_orders(sort_column)
            .map_err(|f| ServiceError::field("sort", format!("cannot sort by '{}'", f)))?;

        let db = &*self.db;
        let select = card::Entity::find().filter(filter.condition());
        let select = filters::apply_full_text(
            select,
            db.get_database_backend(),
            filter.alias.as_deref(),
            &[card::Column::Alias],
        );

        filters::fetch_page(
            db,
            select,
            orders,
            &[card::Column::DateCreated, card::Column::Id],
            page,
        )
        .await
        .map_err(ServiceError::db_error)
    }
}
