use super::common::{
    created_response, no_content_response, success_response, ApiJson, ApiPath, ApiQuery,
    UnmaskParams,
};
use crate::{
    auth::{permissions::consts as perm, AuthUser},
    clients::CallContext,
    db::PageRequest,
    errors::ServiceError,
    services::cards::{CardFilter, CardResponse, CreateCardRequest, UpdateCardRequest},
    AppState,
};
use axum::{extract::State, response::Response};
use uuid::Uuid;

/// Clear PAN/CVV needs `card:unmask` on top of read access.
fn check_unmask(user: &AuthUser, unmask: bool) -> Result<(), ServiceError> {
    if unmask {
        user.require(perm::CARD_UNMASK)?;
    }
    Ok(())
}

pub async fn list_cards(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(filter): ApiQuery<CardFilter>,
    ApiQuery(page): ApiQuery<PageRequest>,
    ApiQuery(UnmaskParams { unmask }): ApiQuery<UnmaskParams>,
) -> Result<Response, ServiceError> {
    check_unmask(&user, unmask)?;
    let found = state.services.cards.list_cards(&filter, &page).await?;
    Ok(success_response(
        found.map(|card| CardResponse::from_model(card, unmask)),
    ))
}

pub async fn create_card(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<CreateCardRequest>,
) -> Result<Response, ServiceError> {
    let created = state
        .services
        .cards
        .create_card(&CallContext::for_user(&user), request)
        .await?;
    Ok(created_response(CardResponse::masked(created)))
}

pub async fn get_card(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(UnmaskParams { unmask }): ApiQuery<UnmaskParams>,
) -> Result<Response, ServiceError> {
    check_unmask(&user, unmask)?;
    let card = state.services.cards.get_card(id).await?;
    Ok(success_response(CardResponse::from_model(card, unmask)))
}

pub async fn update_card(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<UpdateCardRequest>,
) -> Result<Response, ServiceError> {
    let updated = state.services.cards.update_card(id, request).await?;
    Ok(success_response(CardResponse::masked(updated)))
}

pub async fn delete_card(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ServiceError> {
    state.services.cards.delete_card(id).await?;
    Ok(no_content_response())
}
