// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.
//! Integration tests for the HTTP API, including concurrent requests.

mod common;

use common::{SIGNATURE_HEADER, harness, webhook};
use payment_settlement_rs::api::{self, AppState, ErrorResponse};
use reqwest::{Client, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Serves the API on an ephemeral port and returns its base URL.
async fn spawn_server(h: &common::Harness) -> String {
    let state = AppState::new(h.orchestrator.clone(), dec!(0.01));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn payment_body(key: &str, amount: &str) -> Value {
    json!({
        "idempotency_key": key,
        "amount": amount,
        "currency": "RWF",
        "provider": "mtn_momo",
        "method": "mobile_money",
        "payable": {"kind": "order", "reference": "1042"},
        "payer": "250781234567"
    })
}

async fn create(client: &Client, base: &str, key: &str, amount: &str) -> Value {
    let response = client
        .post(format!("{base}/payments"))
        .json(&payment_body(key, amount))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    response.json().await.unwrap()
}

async fn deliver(client: &Client, base: &str, reference: &str, status: &str) -> reqwest::Response {
    let (body, signature) = webhook(reference, status, None);
    client
        .post(format!("{base}/webhooks/mtn_momo"))
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn payment_lifecycle_over_http() {
    let h = harness();
    let base = spawn_server(&h).await;
    let client = Client::new();

    let payment = create(&client, &base, "order-1", "5000").await;
    assert_eq!(payment["status"], "AWAITING_CONFIRMATION");
    let id = payment["id"].as_u64().unwrap();
    let reference = payment["external_ref"].as_str().unwrap().to_string();

    let response = deliver(&client, &base, &reference, "SUCCESSFUL").await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: Value = response.json().await.unwrap();
    assert_eq!(outcome, json!({"outcome": "TRANSITIONED", "status": "CONFIRMED"}));

    let duplicate: Value = deliver(&client, &base, &reference, "SUCCESSFUL")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(duplicate["outcome"], "DUPLICATE");

    let invoice: Value = client
        .get(format!("{base}/payments/{id}/invoice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(invoice["total_amount"], "5000");

    let log: Vec<Value> = client
        .get(format!("{base}/payments/{id}/transactions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[3]["status"], "CONFIRMED");
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_carry_status_and_code() {
    let h = harness();
    let base = spawn_server(&h).await;
    let client = Client::new();

    let response = client.get(format!("{base}/payments/999")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, "PAYMENT_NOT_FOUND");

    let response = client
        .post(format!("{base}/payments"))
        .json(&payment_body("order-2", "-5"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let payment = create(&client, &base, "order-3", "100").await;
    let reference = payment["external_ref"].as_str().unwrap();
    let response = client
        .post(format!("{base}/webhooks/mtn_momo"))
        .header(SIGNATURE_HEADER, "forged")
        .body(webhook(reference, "SUCCESSFUL", None).0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, "WEBHOOK_AUTHENTICATION");

    let response = client
        .post(format!("{base}/webhooks/paypal"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, "UNKNOWN_PROVIDER");
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_and_refunds_over_http() {
    let h = harness();
    h.adapter.assign_references(&["X123"]);
    let base = spawn_server(&h).await;
    let client = Client::new();

    let payment = create(&client, &base, "order-1", "5000").await;
    let id = payment["id"].as_u64().unwrap();
    deliver(&client, &base, "X123", "SUCCESSFUL").await;

    let today = chrono::Utc::now().date_naive().to_string();
    let run: Value = client
        .post(format!("{base}/reconciliations/csv"))
        .query(&[
            ("provider", "MTN"),
            ("file_name", "mtn.csv"),
            ("period_start", today.as_str()),
            ("period_end", today.as_str()),
        ])
        .body(format!("reference,amount,date\nX123,5000,{today}\n"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["matched_count"], 1);
    assert_eq!(run["discrepancy_amount"], "0");
    assert_eq!(run["status"], "COMPLETE");

    let runs: Vec<Value> = client
        .get(format!("{base}/reconciliations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);

    let response = client
        .post(format!("{base}/refunds"))
        .json(&json!({"payment_id": id, "amount": "6000", "reason": "too much"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.code, "REFUND_AMOUNT_EXCEEDED");

    let refund: Value = client
        .post(format!("{base}/refunds"))
        .json(&json!({"payment_id": id, "amount": "2000", "reason": "damaged item"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let refund_id = refund["id"].as_u64().unwrap();

    let response = client
        .post(format!("{base}/refunds/{refund_id}/execute"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let approved: Value = client
        .post(format!("{base}/refunds/{refund_id}/approve"))
        .json(&json!({"approver": "finance@shop"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(approved["status"], "APPROVED");

    let completed: Value = client
        .post(format!("{base}/refunds/{refund_id}/execute"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(completed["status"], "COMPLETED");

    let summary: Value = client
        .get(format!("{base}/payments/{id}/refunds"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["refunded_total"], "2000");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_payment_creation() {
    let h = harness();
    let base = spawn_server(&h).await;
    let client = Client::new();

    const REQUESTS: usize = 200;
    let requests = (0..REQUESTS).map(|i| {
        let client = client.clone();
        let base = base.clone();
        // Every key is sent twice.
        async move { create(&client, &base, &format!("order-{}", i / 2), "100").await }
    });
    let payments = futures::future::join_all(requests).await;
    assert_eq!(payments.len(), REQUESTS);

    let listed: Vec<Value> = client
        .get(format!("{base}/payments?status=AWAITING_CONFIRMATION"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), REQUESTS / 2);
    assert_eq!(
        h.adapter.initiate_calls.load(std::sync::atomic::Ordering::SeqCst),
        REQUESTS / 2
    );
}
