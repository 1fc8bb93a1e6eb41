//! Deleting a customer removes its accounts, which in turn removes their
//! cards, once the outbox has been relayed and the queues consumed.

mod common;

use axum::http::StatusCode;
use common::{TestApp, MASTERCARD_PAN, VISA_PAN};
use dtbank_api::events::{
    consumers::Delivery, ACCOUNT_DELETED_BINDING, CUSTOMER_DELETED_BINDING,
};
use dtbank_api::message_queue::{Message, MessageQueue};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn customer_delete_cascades_to_accounts_and_cards() {
    let app = TestApp::new().await;
    let customer_id = app.create_customer("Ada", "Lovelace").await;
    let keep_customer = app.create_customer("Grace", "Hopper").await;

    let first = app.create_account(customer_id).await;
    let second = app.create_account(customer_id).await;
    let kept_account = app.create_account(keep_customer).await;

    let debit = app.create_card(first, "DEBIT", VISA_PAN).await;
    let credit = app.create_card(first, "CREDIT", MASTERCARD_PAN).await;
    let other = app.create_card(second, "DEBIT", "4012888888881881").await;
    let kept_card = app.create_card(kept_account, "DEBIT", VISA_PAN).await;

    let deleted = app
        .delete(&format!("/api/v1/customers/{}", customer_id))
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    // Nothing downstream happens until the event is relayed and consumed.
    assert_eq!(
        app.get(&format!("/api/v1/accounts/{}", first)).await.status,
        StatusCode::OK
    );

    assert_eq!(app.relay_outbox().await, 1);
    assert_eq!(app.queue.depth(CUSTOMER_DELETED_BINDING.queue), 1);
    let customer_deliveries = app.consume(CUSTOMER_DELETED_BINDING.queue).await;
    assert_eq!(customer_deliveries, vec![Delivery::Acked]);

    for account in [first, second] {
        let response = app.get(&format!("/api/v1/accounts/{}", account)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
    // Cards wait for the account events.
    assert_eq!(
        app.get(&format!("/api/v1/cards/{}", debit)).await.status,
        StatusCode::OK
    );

    assert_eq!(app.relay_outbox().await, 2);
    let account_deliveries = app.consume(ACCOUNT_DELETED_BINDING.queue).await;
    assert_eq!(account_deliveries, vec![Delivery::Acked, Delivery::Acked]);

    for card in [debit, credit, other] {
        let response = app.get(&format!("/api/v1/cards/{}", card)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    assert_eq!(
        app.get(&format!("/api/v1/accounts/{}", kept_account))
            .await
            .status,
        StatusCode::OK
    );
    assert_eq!(
        app.get(&format!("/api/v1/cards/{}", kept_card)).await.status,
        StatusCode::OK
    );
    assert_eq!(app.queue.in_flight(), 0);
}

#[tokio::test]
async fn account_delete_cascades_to_its_cards() {
    let app = TestApp::new().await;
    let customer_id = app.create_customer("Ada", "Lovelace").await;
    let account_id = app.create_account(customer_id).await;
    let card_id = app.create_card(account_id, "DEBIT", VISA_PAN).await;

    let deleted = app
        .delete(&format!("/api/v1/accounts/{}", account_id))
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    app.settle_cascade().await;

    assert_eq!(
        app.get(&format!("/api/v1/cards/{}", card_id)).await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        app.get(&format!("/api/v1/customers/{}", customer_id))
            .await
            .status,
        StatusCode::OK
    );
}

#[tokio::test]
async fn replayed_events_are_harmless() {
    let app = TestApp::new().await;
    let customer_id = app.create_customer("Ada", "Lovelace").await;
    let account_id = app.create_account(customer_id).await;
    app.create_card(account_id, "DEBIT", VISA_PAN).await;

    app.delete(&format!("/api/v1/customers/{}", customer_id))
        .await;
    app.settle_cascade().await;

    // Redeliver both events as a broker would after a lost ack.
    app.queue
        .publish(Message::new(
            CUSTOMER_DELETED_BINDING.queue,
            CUSTOMER_DELETED_BINDING.routing_key,
            json!({ "customerId": customer_id }),
        ))
        .await
        .expect("publish customer event");
    app.queue
        .publish(Message::new(
            ACCOUNT_DELETED_BINDING.queue,
            ACCOUNT_DELETED_BINDING.routing_key,
            json!({ "accountId": account_id }),
        ))
        .await
        .expect("publish account event");

    assert_eq!(
        app.consume(CUSTOMER_DELETED_BINDING.queue).await,
        vec![Delivery::Acked]
    );
    assert_eq!(
        app.consume(ACCOUNT_DELETED_BINDING.queue).await,
        vec![Delivery::Acked]
    );
    // A replay of an already applied delete publishes nothing new.
    assert_eq!(app.relay_outbox().await, 0);
}

#[tokio::test]
async fn events_for_unknown_ids_are_acked() {
    let app = TestApp::new().await;

    app.queue
        .publish(Message::new(
            CUSTOMER_DELETED_BINDING.queue,
            CUSTOMER_DELETED_BINDING.routing_key,
            json!({ "customerId": Uuid::new_v4() }),
        ))
        .await
        .expect("publish");

    assert_eq!(
        app.consume(CUSTOMER_DELETED_BINDING.queue).await,
        vec![Delivery::Acked]
    );
    assert_eq!(app.relay_outbox().await, 0);
}

#[tokio::test]
async fn undecodable_events_are_discarded() {
    let app = TestApp::new().await;

    app.queue
        .publish(Message::new(
            ACCOUNT_DELETED_BINDING.queue,
            ACCOUNT_DELETED_BINDING.routing_key,
            json!({ "accountId": "not-a-uuid" }),
        ))
        .await
        .expect("publish");

    assert_eq!(
        app.consume(ACCOUNT_DELETED_BINDING.queue).await,
        vec![Delivery::Discarded]
    );
    assert_eq!(app.queue.depth(ACCOUNT_DELETED_BINDING.queue), 0);
}
