use super::common::{created_response, no_content_response, success_response, ApiJson, ApiPath, ApiQuery};
use crate::{
    auth::AuthUser,
    clients::CallContext,
    db::PageRequest,
    errors::ServiceError,
    services::{
        accounts::{AccountFilter, NewAccountRequest},
        customers::{CustomerFilter, CustomerRequest, CustomerResponse},
    },
    AppState,
};
use axum::{extract::State, response::Response};
use uuid::Uuid;

pub async fn list_customers(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<CustomerFilter>,
    ApiQuery(page): ApiQuery<PageRequest>,
) -> Result<Response, ServiceError> {
    let found = state.services.customers.list_customers(&filter, &page).await?;
    Ok(success_response(found.map(CustomerResponse::from)))
}

pub async fn create_customer(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CustomerRequest>,
) -> Result<Response, ServiceError> {
    let created = state.services.customers.create_customer(request).await?;
    Ok(created_response(CustomerResponse::from(created)))
}

pub async fn get_customer(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ServiceError> {
    let customer = state.services.customers.get_customer(id).await?;
    Ok(success_response(CustomerResponse::from(customer)))
}

pub async fn update_customer(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<CustomerRequest>,
) -> Result<Response, ServiceError> {
    let updated = state.services.customers.update_customer(id, request).await?;
    Ok(success_response(CustomerResponse::from(updated)))
}

pub async fn delete_customer(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ServiceError> {
    state.services.customers.delete_customer(id).await?;
    Ok(no_content_response())
}

pub async fn create_customer_account(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(customer_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<NewAccountRequest>,
) -> Result<Response, ServiceError> {
    let created = state
        .services
        .customers
        .create_account_for_customer(&CallContext::for_user(&user), customer_id, request)
        .await?;
    Ok(created_response(created))
}

pub async fn list_customer_accounts(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(customer_id): ApiPath<Uuid>,
    ApiQuery(filter): ApiQuery<AccountFilter>,
    ApiQuery(page): ApiQuery<PageRequest>,
) -> Result<Response, ServiceError> {
    let found = state
        .services
        .customers
        .list_accounts_for_customer(&CallContext::for_user(&user), customer_id, filter, &page)
        .await?;
    Ok(success_response(found))
}
