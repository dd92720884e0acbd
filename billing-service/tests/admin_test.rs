//! Operator overview, tenant status and manual invoice runs.

mod common;

use billing_service::models::TenantStatus;
use billing_service::store::BillingStore;
use common::{TestApp, TEST_TENANT_ID};
use serde_json::{json, Value};

#[tokio::test]
async fn tenants_overview_lists_seeded_tenant() {
    let app = TestApp::spawn().await;
    app.seed_tenant(TEST_TENANT_ID).await;

    let response = app.get("/billing/admin/tenants").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["summary"]["totalTenants"], 1);
    assert_eq!(body["tenants"][0]["tenant_id"], TEST_TENANT_ID);
    assert_eq!(body["tenants"][0]["creator_name"], "Acme GmbH");
    assert_eq!(body["tenants"][0]["status"], "pending");
    assert_eq!(body["tenants"][0]["totalInvoices"], 0);
}

#[tokio::test]
async fn tenant_status_is_validated_and_stored() {
    let app = TestApp::spawn().await;
    app.seed_tenant(TEST_TENANT_ID).await;
    let path = format!("/billing/admin/tenants/{}/status", TEST_TENANT_ID);

    let response = app.put_json(&path, json!({ "status": "deleted" })).await;
    assert_eq!(response.status().as_u16(), 400);

    let response = app
        .put_json(&path, json!({ "status": "suspended", "reason": "Rechnung offen" }))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "suspended");
    assert_eq!(body["reason"], "Rechnung offen");

    let tenant = app.store.get_tenant(TEST_TENANT_ID).await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Suspended);

    let response = app
        .put_json("/billing/admin/tenants/ghost/status", json!({ "status": "active" }))
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn generated_invoices_show_up_in_admin_listing() {
    let app = TestApp::spawn().await;
    app.seed_tenant(TEST_TENANT_ID).await;

    let response = app.post_json("/billing/generate-invoices", json!({})).await;
    assert_eq!(response.status().as_u16(), 200);

    let listing: Value = app.get("/billing/admin/invoices").await.json().await.unwrap();
    let total = listing["summary"]["totalInvoices"].as_u64().unwrap();
    assert_eq!(listing["invoices"].as_array().unwrap().len() as u64, total);
}

#[tokio::test]
async fn available_payment_methods_follow_configuration() {
    let app = TestApp::spawn().await;

    let response = app.get(&format!("/billing/payment-methods/{}", TEST_TENANT_ID)).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["stripe"]["enabled"], true);
    assert_eq!(body["paypal"]["enabled"], true);
    assert_eq!(body["stripe"]["name"], "Kreditkarte / SEPA");
    assert!(body.get("savedPaymentMethod").is_none());
}
