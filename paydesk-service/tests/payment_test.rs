//! Integration tests for payments and mobile-money reconciliation.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    amount, create_invoice, create_school, create_student, spawn_app,
    spawn_app_with_callback_secret, School, TestApp,
};
use paydesk_service::services::payments::sign_callback;
use rust_decimal::Decimal;
use serde_json::{json, Value};

async fn push(app: &TestApp, school: &School, student_id: &str, invoice_id: &str, amount: &str) -> Value {
    let response = app
        .post(
            "/payments/mpesa/stk-push",
            &school.parent("parent-1"),
            json!({
                "student_id": student_id,
                "invoice_id": invoice_id,
                "phone_number": "0712345678",
                "amount": amount,
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.text);
    response.body
}

async fn callback(app: &TestApp, body: Value) -> common::TestResponse {
    app.request("POST", "/payments/mpesa/callback", None, Some(body)).await
}

#[tokio::test]
async fn replayed_success_callback_is_applied_once() {
    let app = spawn_app();
    let school = create_school(&app, "PAY1").await;
    let student_id = create_student(&app, &school, &school.class_id, "M-1", Some("parent-1")).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 2500).await;

    let payment = push(&app, &school, &student_id, &invoice_id, "1000").await;
    assert_eq!(payment["status"], "PENDING");
    assert_eq!(payment["method"], "MPESA");
    assert_eq!(payment["phone_number"], "254712345678");
    let checkout = payment["checkout_request_id"].as_str().unwrap().to_string();
    assert_eq!(app.gateway.push_count(), 1);

    let body = json!({
        "checkout_request_id": checkout,
        "result_code": 0,
        "result_desc": "The service request is processed successfully.",
        "transaction_id": "QKX81Y2Z",
        "amount": "1000",
    });

    let first = callback(&app, body.clone()).await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.text);
    assert_eq!(first.body["outcome"], "applied");
    assert_eq!(first.body["payment"]["status"], "COMPLETED");

    let replay = callback(&app, body).await;
    assert_eq!(replay.status, StatusCode::OK);
    assert_eq!(replay.body["outcome"], "duplicate");

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(amount(&invoice.body["paid_amount"]), Decimal::from(1000));
    assert_eq!(amount(&invoice.body["balance"]), Decimal::from(1500));
    assert_eq!(invoice.body["status"], "PARTIALLY_PAID");
}

#[tokio::test]
async fn failed_callback_marks_payment_failed() {
    let app = spawn_app();
    let school = create_school(&app, "PAY2").await;
    let student_id = create_student(&app, &school, &school.class_id, "M-2", Some("parent-1")).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 2500).await;

    let payment = push(&app, &school, &student_id, &invoice_id, "2500").await;
    let checkout = payment["checkout_request_id"].as_str().unwrap();

    let response = callback(
        &app,
        json!({ "checkout_request_id": checkout, "result_code": 1032, "result_desc": "Request cancelled by user" }),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(response.body["outcome"], "failed");
    assert_eq!(response.body["payment"]["status"], "FAILED");

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "PENDING");

    let unknown = callback(&app, json!({ "checkout_request_id": "ws_CO_missing", "result_code": 0, "transaction_id": "X" })).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signed_callbacks_are_verified_when_a_secret_is_set() {
    let app = spawn_app_with_callback_secret("gateway-secret");
    let school = create_school(&app, "PAY3").await;
    let student_id = create_student(&app, &school, &school.class_id, "M-3", Some("parent-1")).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 1000).await;

    let payment = push(&app, &school, &student_id, &invoice_id, "1000").await;
    let body = json!({
        "checkout_request_id": payment["checkout_request_id"],
        "result_code": 0,
        "transaction_id": "QKSIGNED1",
    })
    .to_string();

    let unsigned = callback(&app, serde_json::from_str(&body).unwrap()).await;
    assert_eq!(unsigned.status, StatusCode::UNAUTHORIZED);

    let forged = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/payments/mpesa/callback")
                .header("Content-Type", "application/json")
                .header("X-Callback-Signature", sign_callback("wrong", body.as_bytes()).unwrap())
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);

    let signed = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/payments/mpesa/callback")
                .header("Content-Type", "application/json")
                .header(
                    "X-Callback-Signature",
                    sign_callback("gateway-secret", body.as_bytes()).unwrap(),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
    assert_eq!(signed.status, StatusCode::OK, "{}", signed.text);

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "PAID");
}

#[tokio::test]
async fn manual_payments_settle_invoices() {
    let app = spawn_app();
    let school = create_school(&app, "PAY4").await;
    let student_id = create_student(&app, &school, &school.class_id, "M-4", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 1200).await;

    let mpesa = app
        .post(
            "/payments",
            &school.bursar,
            json!({ "student_id": student_id, "invoice_id": invoice_id, "amount": "100", "method": "MPESA" }),
        )
        .await;
    assert_eq!(mpesa.status, StatusCode::BAD_REQUEST);

    let zero = app
        .post(
            "/payments",
            &school.bursar,
            json!({ "student_id": student_id, "invoice_id": invoice_id, "amount": "0", "method": "CASH" }),
        )
        .await;
    assert_eq!(zero.status, StatusCode::BAD_REQUEST);

    let paid = app
        .post(
            "/payments",
            &school.bursar,
            json!({ "student_id": student_id, "invoice_id": invoice_id, "amount": "1200", "method": "CHEQUE", "reference": "CHQ-0091" }),
        )
        .await;
    assert_eq!(paid.status, StatusCode::CREATED, "{}", paid.text);
    assert_eq!(paid.body["status"], "COMPLETED");

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "PAID");
    assert_eq!(amount(&invoice.body["balance"]), Decimal::ZERO);

    let payments = app
        .get(&format!("/payments?student_id={}", student_id), &school.bursar)
        .await;
    assert_eq!(payments.body["total"], 1);
}

#[tokio::test]
async fn parents_cannot_push_for_other_children() {
    let app = spawn_app();
    let school = create_school(&app, "PAY5").await;
    let student_id = create_student(&app, &school, &school.class_id, "M-5", Some("parent-9")).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 1000).await;

    let response = app
        .post(
            "/payments/mpesa/stk-push",
            &school.parent("parent-1"),
            json!({
                "student_id": student_id,
                "invoice_id": invoice_id,
                "phone_number": "0712345678",
                "amount": "500",
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(app.gateway.push_count(), 0);
}
