//! Stripe subscription, payment method and usage routes.

mod common;

use billing_service::models::TenantBillingAccount;
use chrono::Utc;
use common::{TestApp, TEST_TENANT_ID};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

fn with_stripe_customer(app: &TestApp) {
    let mut account = TenantBillingAccount::new(TEST_TENANT_ID, Utc::now());
    account.provider_customer_ids.stripe = Some("cus_1".to_string());
    app.store.seed_account(&account);
}

#[tokio::test]
async fn subscription_status_without_subscription() {
    let app = TestApp::spawn().await;

    let response = app
        .get(&format!("/billing/stripe/subscription/{}", TEST_TENANT_ID))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["hasSubscription"], false);
}

#[tokio::test]
async fn create_subscription_requires_price() {
    let app = TestApp::spawn().await;
    with_stripe_customer(&app);

    let response = app
        .post_json(
            &format!("/billing/stripe/create-subscription/{}", TEST_TENANT_ID),
            json!({}),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn cancel_without_subscription_is_not_found() {
    let app = TestApp::spawn().await;
    with_stripe_customer(&app);

    let response = app
        .post_json(
            &format!("/billing/stripe/cancel-subscription/{}", TEST_TENANT_ID),
            json!({ "immediately": true }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn add_payment_method_requires_id() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            &format!("/billing/stripe/payment-method/{}", TEST_TENANT_ID),
            json!({ "setAsDefault": false }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn delete_without_any_payment_method_is_not_found() {
    let app = TestApp::spawn().await;
    with_stripe_customer(&app);

    let response = app
        .delete(&format!("/billing/stripe/payment-method/{}", TEST_TENANT_ID))
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn usage_is_added_as_invoice_item() {
    let app = TestApp::spawn().await;
    with_stripe_customer(&app);
    Mock::given(method("POST"))
        .and(path("/v1/invoiceitems"))
        .and(body_string_contains("customer=cus_1"))
        .and(body_string_contains("amount=1299"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ii_1", "amount": 1299, "description": "S3 Speicher"
        })))
        .expect(1)
        .mount(&app.stripe)
        .await;

    let response = app
        .post_json(
            &format!("/billing/stripe/add-usage/{}", TEST_TENANT_ID),
            json!({ "amount": "12.99", "invoiceItemDescription": "S3 Speicher" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["invoiceItemId"], "ii_1");
    assert_eq!(body["description"], "S3 Speicher");
}

#[tokio::test]
async fn usage_without_customer_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            &format!("/billing/stripe/add-usage/{}", TEST_TENANT_ID),
            json!({ "amount": "5" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn stripe_invoices_without_customer_are_empty() {
    let app = TestApp::spawn().await;

    let body: Value = app
        .get(&format!("/billing/stripe/invoices/{}", TEST_TENANT_ID))
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(body["invoices"], json!([]));
}
