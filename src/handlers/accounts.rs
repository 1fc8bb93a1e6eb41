use super::common::{
    created_response, no_content_response, success_response, ApiJson, ApiPath, ApiQuery,
    UnmaskParams,
};
use crate::{
    auth::{permissions::consts as perm, AuthUser},
    clients::CallContext,
    db::PageRequest,
    errors::ServiceError,
    services::{
        accounts::{AccountFilter, AccountResponse, CreateAccountRequest, UpdateAccountRequest},
        cards::{CardFilter, NewCardRequest},
    },
    AppState,
};
use axum::{extract::State, response::Response};
use uuid::Uuid;

pub async fn list_accounts(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<AccountFilter>,
    ApiQuery(page): ApiQuery<PageRequest>,
) -> Result<Response, ServiceError> {
    let found = state.services.accounts.list_accounts(&filter, &page).await?;
    Ok(success_response(found.map(AccountResponse::from)))
}

pub async fn create_account(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<CreateAccountRequest>,
) -> Result<Response, ServiceError> {
    let created = state
        .services
        .accounts
        .create_account(&CallContext::for_user(&user), request)
        .await?;
    Ok(created_response(AccountResponse::from(created)))
}

pub async fn get_account(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ServiceError> {
    let account = state.services.accounts.get_account(id).await?;
    Ok(success_response(AccountResponse::from(account)))
}

pub async fn update_account(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<UpdateAccountRequest>,
) -> Result<Response, ServiceError> {
    let updated = state.services.accounts.update_account(id, request).await?;
    Ok(success_response(AccountResponse::from(updated)))
}

pub async fn delete_account(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ServiceError> {
    state.services.accounts.delete_account(id).await?;
    Ok(no_content_response())
}

pub async fn create_account_card(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(account_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<NewCardRequest>,
) -> Result<Response, ServiceError> {
    let created = state
        .services
        .accounts
        .create_card_for_account(&CallContext::for_user(&user), account_id, request)
        .await?;
    Ok(created_response(created))
}

pub async fn list_account_cards(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(account_id): ApiPath<Uuid>,
    ApiQuery(filter): ApiQuery<CardFilter>,
    ApiQuery(page): ApiQuery<PageRequest>,
    ApiQuery(UnmaskParams { unmask }): ApiQuery<UnmaskParams>,
) -> Result<Response, ServiceError> {
    if unmask {
        user.require(perm::CARD_UNMASK)?;
    }
    let found = state
        .services
        .accounts
        .list_cards_for_account(&CallContext::for_user(&user), account_id, filter, &page, unmask)
        .await?;
    Ok(success_response(found))
}
