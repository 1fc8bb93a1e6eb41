mod common;

use axum::http::{Method, StatusCode};
use chrono::{Days, Utc};
use common::{mint_token, TestApp, MASTERCARD_PAN, VISA_PAN};
use serde_json::json;
use uuid::Uuid;

const MASKED_PAN: &str = "*************";
const MASKED_CVV: &str = "***";

async fn account(app: &TestApp) -> Uuid {
    let customer_id = app.create_customer("Ada", "Lovelace").await;
    app.create_account(customer_id).await
}

#[tokio::test]
async fn created_card_is_masked_and_readable_in_clear() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;

    let created = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Travel",
                "pan": "4111-1111-1111-1111",
                "cvv": "123",
                "type": "DEBIT",
                "accountId": account_id,
            }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.body);
    assert_eq!(created.body["pan"], MASKED_PAN);
    assert_eq!(created.body["cvv"], MASKED_CVV);
    assert_eq!(created.body["type"], "DEBIT");

    let uri = format!("/api/v1/cards/{}", created.id());
    let masked = app.get(&uri).await;
    assert_eq!(masked.body["pan"], MASKED_PAN);

    let clear = app.get(&format!("{}?unmask=true", uri)).await;
    assert_eq!(clear.status, StatusCode::OK);
    assert_eq!(clear.body["pan"], VISA_PAN);
    assert_eq!(clear.body["cvv"], "123");
}

#[tokio::test]
async fn unmask_false_keeps_the_mask() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    let card_id = app.create_card(account_id, "DEBIT", VISA_PAN).await;

    let response = app
        .get(&format!("/api/v1/cards/{}?unmask=false", card_id))
        .await;

    assert_eq!(response.body["pan"], MASKED_PAN);
    assert_eq!(response.body["cvv"], MASKED_CVV);
}

#[tokio::test]
async fn unmask_needs_its_own_permission() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    let card_id = app.create_card(account_id, "DEBIT", VISA_PAN).await;
    let reader = mint_token(&[], &["card:read"]);
    let uri = format!("/api/v1/cards/{}", card_id);

    let masked = app.request(Method::GET, &uri, None, Some(&reader)).await;
    assert_eq!(masked.status, StatusCode::OK);
    assert_eq!(masked.body["pan"], MASKED_PAN);

    let denied = app
        .request(
            Method::GET,
            &format!("{}?unmask=true", uri),
            None,
            Some(&reader),
        )
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let unmasker = mint_token(&[], &["card:read", "card:unmask"]);
    let clear = app
        .request(
            Method::GET,
            &format!("{}?unmask=true", uri),
            None,
            Some(&unmasker),
        )
        .await;
    assert_eq!(clear.body["pan"], VISA_PAN);
}

#[tokio::test]
async fn one_card_per_type_per_account() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    app.create_card(account_id, "DEBIT", VISA_PAN).await;

    let duplicate = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Second debit",
                "pan": "4012888888881881",
                "cvv": "999",
                "type": "DEBIT",
                "accountId": account_id,
            }),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.error_code(), "CARD_TYPE_ALREADY_EXISTS");

    let credit = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Credit",
                "pan": MASTERCARD_PAN,
                "cvv": "999",
                "type": "CREDIT",
                "accountId": account_id,
            }),
        )
        .await;
    assert_eq!(credit.status, StatusCode::CREATED);
}

#[tokio::test]
async fn card_for_unknown_account_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Orphan",
                "pan": VISA_PAN,
                "cvv": "123",
                "type": "DEBIT",
                "accountId": Uuid::new_v4(),
            }),
        )
        .await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.error_code(), "ACCOUNT_NOT_FOUND");
}

#[tokio::test]
async fn pan_must_pass_the_checksum() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;

    let response = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Typo",
                "pan": "4111111111111112",
                "cvv": "123",
                "type": "DEBIT",
                "accountId": account_id,
            }),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.body["fieldErrors"]["pan"].is_array());
}

#[tokio::test]
async fn checksum_can_be_switched_off() {
    let app = TestApp::with_config(|cfg| cfg.pan_luhn_check = false).await;
    let account_id = account(&app).await;

    let card_id = app
        .create_card(account_id, "DEBIT", "4111111111111112")
        .await;

    let clear = app
        .get(&format!("/api/v1/cards/{}?unmask=true", card_id))
        .await;
    assert_eq!(clear.body["pan"], "4111111111111112");
}

#[tokio::test]
async fn malformed_card_fields_are_rejected() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;

    let response = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "",
                "pan": "4111",
                "cvv": "12a",
                "type": "DEBIT",
                "accountId": account_id,
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    for field in ["alias", "pan", "cvv"] {
        assert!(
            response.body["fieldErrors"][field].is_array(),
            "missing {} in {}",
            field,
            response.body
        );
    }

    let bad_type = app
        .post(
            "/api/v1/cards",
            json!({
                "alias": "Travel",
                "pan": VISA_PAN,
                "cvv": "123",
                "type": "PREPAID",
                "accountId": account_id,
            }),
        )
        .await;
    assert_eq!(bad_type.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_replaces_alias_and_secrets_but_not_type() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    let card_id = app.create_card(account_id, "DEBIT", VISA_PAN).await;
    let uri = format!("/api/v1/cards/{}", card_id);

    let updated = app
        .put(
            &uri,
            json!({ "alias": "Renamed", "pan": MASTERCARD_PAN, "cvv": "777", "type": "CREDIT" }),
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK, "{}", updated.body);
    assert_eq!(updated.body["alias"], "Renamed");
    assert_eq!(updated.body["pan"], MASKED_PAN);
    assert_eq!(updated.body["type"], "DEBIT");

    let clear = app.get(&format!("{}?unmask=true", uri)).await;
    assert_eq!(clear.body["pan"], MASTERCARD_PAN);
    assert_eq!(clear.body["cvv"], "777");
}

#[tokio::test]
async fn delete_card_then_not_found() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    let card_id = app.create_card(account_id, "DEBIT", VISA_PAN).await;
    let uri = format!("/api/v1/cards/{}", card_id);

    assert_eq!(app.delete(&uri).await.status, StatusCode::NO_CONTENT);
    let again = app.delete(&uri).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(again.error_code(), "CARD_NOT_FOUND");
}

#[tokio::test]
async fn filters_by_type_pan_and_alias_text() {
    let app = TestApp::new().await;
    let first = account(&app).await;
    let second = account(&app).await;

    app.post(
        "/api/v1/cards",
        json!({ "alias": "Family travel", "pan": VISA_PAN, "cvv": "123", "type": "DEBIT", "accountId": first }),
    )
    .await;
    app.post(
        "/api/v1/cards",
        json!({ "alias": "Office supplies", "pan": MASTERCARD_PAN, "cvv": "123", "type": "CREDIT", "accountId": first }),
    )
    .await;
    app.post(
        "/api/v1/cards",
        json!({ "alias": "Business travel", "pan": "4012888888881881", "cvv": "123", "type": "CREDIT", "accountId": second }),
    )
    .await;

    let credit = app.get("/api/v1/cards?type=CREDIT").await;
    assert_eq!(credit.total_elements(), 2);

    let by_pan = app
        .get(&format!("/api/v1/cards?pan={}", MASTERCARD_PAN))
        .await;
    assert_eq!(by_pan.total_elements(), 1);
    assert_eq!(by_pan.content()[0]["alias"], "Office supplies");
    assert_eq!(by_pan.content()[0]["pan"], MASKED_PAN);

    let travel = app.get("/api/v1/cards?alias=travel").await;
    assert_eq!(travel.total_elements(), 2);

    let business_travel = app
        .get("/api/v1/cards?alias=travel%20-family")
        .await;
    assert_eq!(business_travel.total_elements(), 1);
    assert_eq!(business_travel.content()[0]["alias"], "Business travel");

    let scoped = app
        .get(&format!("/api/v1/cards?accountId={}&type=CREDIT", first))
        .await;
    assert_eq!(scoped.total_elements(), 1);
}

#[tokio::test]
async fn sorting_by_pan_is_not_allowed() {
    let app = TestApp::new().await;

    let response = app.get("/api/v1/cards?sort=pan").await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn date_window_with_one_open_bound() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    app.create_card(account_id, "DEBIT", VISA_PAN).await;

    let today = Utc::now().date_naive();
    let tomorrow = today.checked_add_days(Days::new(1)).expect("date");
    let yesterday = today.checked_sub_days(Days::new(1)).expect("date");

    let from_today = app
        .get(&format!("/api/v1/cards?startDateCreated={}", today))
        .await;
    assert_eq!(from_today.total_elements(), 1);

    let until_today = app
        .get(&format!("/api/v1/cards?endDateCreated={}", today))
        .await;
    assert_eq!(until_today.total_elements(), 1);

    let from_tomorrow = app
        .get(&format!("/api/v1/cards?startDateCreated={}", tomorrow))
        .await;
    assert_eq!(from_tomorrow.total_elements(), 0);

    let until_yesterday = app
        .get(&format!("/api/v1/cards?endDateCreated={}", yesterday))
        .await;
    assert_eq!(until_yesterday.total_elements(), 0);
}

#[tokio::test]
async fn alias_wildcards_match_literally() {
    let app = TestApp::new().await;
    let account_id = account(&app).await;
    app.post(
        "/api/v1/cards",
        json!({ "alias": "50% cashback", "pan": VISA_PAN, "cvv": "123", "type": "DEBIT", "accountId": account_id }),
    )
    .await;
    app.post(
        "/api/v1/cards",
        json!({ "alias": "Groceries", "pan": MASTERCARD_PAN, "cvv": "123", "type": "CREDIT", "accountId": account_id }),
    )
    .await;

    let percent = app.get("/api/v1/cards?alias=%25").await;
    assert_eq!(percent.total_elements(), 1);
    assert_eq!(percent.content()[0]["alias"], "50% cashback");

    let underscore = app.get("/api/v1/cards?alias=_").await;
    assert_eq!(underscore.total_elements(), 0);
}
