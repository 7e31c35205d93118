//! Integration tests for the dual-authorization workflow.

mod common;

use axum::http::StatusCode;
use common::{amount, create_invoice, create_school, create_student, spawn_app, Caller, TestApp};
use rust_decimal::Decimal;
use serde_json::json;

async fn invoice_total(app: &TestApp, caller: &Caller, invoice_id: &str) -> Decimal {
    let response = app.get(&format!("/invoices/{}", invoice_id), caller).await;
    amount(&response.body["total_amount"])
}

#[tokio::test]
async fn large_adjustment_waits_for_a_second_principal() {
    let app = spawn_app();
    let school = create_school(&app, "APR1").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-1", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 20000).await;

    let response = app
        .post(
            &format!("/invoices/{}/adjust", invoice_id),
            &school.bursar,
            json!({ "amount": "15000", "description": "Boarding upgrade", "reason": "Moved to full boarding" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.text);
    assert_eq!(response.body["outcome"], "pending_approval");
    let request_id = response.body["request"]["request_id"].as_str().unwrap().to_string();
    assert_eq!(response.body["request"]["status"], "PENDING");

    // Nothing changes until approval.
    assert_eq!(invoice_total(&app, &school.bursar, &invoice_id).await, Decimal::from(20000));

    let approved = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.principal,
            json!({ "note": "Confirmed with the boarding master" }),
        )
        .await;
    assert_eq!(approved.status, StatusCode::OK, "{}", approved.text);
    assert_eq!(approved.body["status"], "APPROVED");
    assert_eq!(approved.body["approved_by"], "principal-1");

    let invoice = app
        .get(&format!("/invoices/{}", invoice_id), &school.bursar)
        .await;
    assert_eq!(amount(&invoice.body["total_amount"]), Decimal::from(35000));
    assert_eq!(amount(&invoice.body["balance"]), Decimal::from(35000));
    let items = invoice.body["items"].as_array().unwrap();
    assert!(items.iter().any(|i| i["category"] == "ADJUSTMENT"));

    let again = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.second_principal,
            json!({}),
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(invoice_total(&app, &school.bursar, &invoice_id).await, Decimal::from(35000));
}

#[tokio::test]
async fn small_adjustment_applies_immediately() {
    let app = spawn_app();
    let school = create_school(&app, "APR2").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-2", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 5000).await;

    let response = app
        .post(
            &format!("/invoices/{}/adjust", invoice_id),
            &school.bursar,
            json!({ "amount": "-10000", "reason": "Bursary" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST, "negative total must be refused");

    let response = app
        .post(
            &format!("/invoices/{}/adjust", invoice_id),
            &school.bursar,
            json!({ "amount": "-1500", "reason": "Sibling discount" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(response.body["outcome"], "applied");
    assert_eq!(amount(&response.body["invoice"]["total_amount"]), Decimal::from(3500));
}

#[tokio::test]
async fn requester_cannot_approve_their_own_request() {
    let app = spawn_app();
    let school = create_school(&app, "APR3").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-3", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 3000).await;

    let response = app
        .post(
            &format!("/invoices/{}/cancel", invoice_id),
            &school.principal,
            json!({ "reason": "Duplicate billing" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.text);
    let request_id = response.body["request_id"].as_str().unwrap().to_string();

    let own = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.principal,
            json!({}),
        )
        .await;
    assert_eq!(own.status, StatusCode::FORBIDDEN);

    let bursar = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.bursar,
            json!({}),
        )
        .await;
    assert_eq!(bursar.status, StatusCode::FORBIDDEN);

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "PENDING");

    let approved = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.second_principal,
            json!({}),
        )
        .await;
    assert_eq!(approved.status, StatusCode::OK, "{}", approved.text);

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "CANCELLED");
}

#[tokio::test]
async fn rejection_leaves_the_invoice_untouched() {
    let app = spawn_app();
    let school = create_school(&app, "APR4").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-4", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 3000).await;

    let response = app
        .post(
            &format!("/invoices/{}/cancel", invoice_id),
            &school.bursar,
            json!({ "reason": "Student withdrew" }),
        )
        .await;
    let request_id = response.body["request_id"].as_str().unwrap().to_string();

    let duplicate = app
        .post(
            &format!("/invoices/{}/cancel", invoice_id),
            &school.bursar,
            json!({ "reason": "Student withdrew" }),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let rejected = app
        .post(
            &format!("/approvals/{}/reject", request_id),
            &school.principal,
            json!({ "note": "Withdrawal not confirmed" }),
        )
        .await;
    assert_eq!(rejected.status, StatusCode::OK, "{}", rejected.text);
    assert_eq!(rejected.body["status"], "REJECTED");
    assert_eq!(rejected.body["reason"], "Student withdrew");

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "PENDING");

    let pending = app.get("/approvals?status=PENDING", &school.principal).await;
    assert_eq!(pending.body["total"], 0);
}

#[tokio::test]
async fn approval_fails_when_the_invoice_changed_meanwhile() {
    let app = spawn_app();
    let school = create_school(&app, "APR5").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-5", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 20000).await;

    let response = app
        .post(
            &format!("/invoices/{}/adjust", invoice_id),
            &school.bursar,
            json!({ "amount": "12000", "reason": "Transport for the year" }),
        )
        .await;
    let request_id = response.body["request"]["request_id"].as_str().unwrap().to_string();

    let payment = app
        .post(
            "/payments",
            &school.bursar,
            json!({ "student_id": student_id, "invoice_id": invoice_id, "amount": "5000", "method": "BANK_TRANSFER" }),
        )
        .await;
    assert_eq!(payment.status, StatusCode::CREATED);

    let approved = app
        .post(
            &format!("/approvals/{}/approve", request_id),
            &school.principal,
            json!({}),
        )
        .await;
    assert_eq!(approved.status, StatusCode::CONFLICT);

    let request = app
        .get(&format!("/approvals/{}", request_id), &school.principal)
        .await;
    assert_eq!(request.body["status"], "PENDING");
    assert_eq!(invoice_total(&app, &school.bursar, &invoice_id).await, Decimal::from(20000));
}

#[tokio::test]
async fn large_item_changes_must_go_through_approval() {
    let app = spawn_app();
    let school = create_school(&app, "APR6").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-6", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 20000).await;

    let credit = app
        .post(
            &format!("/invoices/{}/items", invoice_id),
            &school.bursar,
            json!({ "description": "Write-off", "amount": "-15000", "category": "OTHER" }),
        )
        .await;
    assert_eq!(credit.status, StatusCode::BAD_REQUEST, "{}", credit.text);

    let adjustment = app
        .post(
            &format!("/invoices/{}/items", invoice_id),
            &school.bursar,
            json!({ "description": "Discount", "amount": "-500", "category": "ADJUSTMENT" }),
        )
        .await;
    assert_eq!(adjustment.status, StatusCode::BAD_REQUEST, "{}", adjustment.text);

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    let tuition = invoice.body["items"][0]["item_id"].as_str().unwrap().to_string();
    let dismissed = app
        .post(
            &format!("/invoices/{}/items/{}/dismiss", invoice_id, tuition),
            &school.bursar,
            json!({}),
        )
        .await;
    assert_eq!(dismissed.status, StatusCode::BAD_REQUEST, "{}", dismissed.text);

    assert_eq!(invoice_total(&app, &school.bursar, &invoice_id).await, Decimal::from(20000));
    let pending = app.get("/approvals", &school.principal).await;
    assert_eq!(pending.body["total"], 0);

    // Small lines are still routine.
    let fee = app
        .post(
            &format!("/invoices/{}/items", invoice_id),
            &school.bursar,
            json!({ "description": "Lab fee", "amount": "800", "category": "ACTIVITY" }),
        )
        .await;
    assert_eq!(fee.status, StatusCode::OK, "{}", fee.text);
    assert_eq!(amount(&fee.body["total_amount"]), Decimal::from(20800));
}

#[tokio::test]
async fn concurrent_approvals_have_exactly_one_winner() {
    let app = spawn_app();
    let school = create_school(&app, "APR7").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-7", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 20000).await;

    let response = app
        .post(
            &format!("/invoices/{}/adjust", invoice_id),
            &school.bursar,
            json!({ "amount": "15000", "reason": "Boarding for the term" }),
        )
        .await;
    let request_id = response.body["request"]["request_id"].as_str().unwrap().to_string();
    let path = format!("/approvals/{}/approve", request_id);

    let (first, second) = tokio::join!(
        app.post(&path, &school.principal, json!({})),
        app.post(&path, &school.second_principal, json!({})),
    );

    let mut statuses = vec![first.status, second.status];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    assert_eq!(invoice_total(&app, &school.bursar, &invoice_id).await, Decimal::from(35000));
}

#[tokio::test]
async fn impersonation_sessions_cannot_resolve_requests() {
    let app = spawn_app();
    let school = create_school(&app, "APR8").await;
    let student_id = create_student(&app, &school, &school.class_id, "P-8", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 3000).await;

    let response = app
        .post(
            &format!("/invoices/{}/cancel", invoice_id),
            &school.principal,
            json!({ "reason": "Duplicate billing" }),
        )
        .await;
    let request_id = response.body["request_id"].as_str().unwrap().to_string();

    let session = app
        .post(
            "/admin/impersonations",
            &Caller::super_admin(),
            json!({
                "target_user_id": "principal-2",
                "target_school_id": school.school_id,
                "target_role": "PRINCIPAL",
                "reason": "Support ticket 412",
            }),
        )
        .await;
    assert_eq!(session.status, StatusCode::CREATED, "{}", session.text);
    let acting = Caller::impersonating(session.body["token"].as_str().unwrap());

    let approved = app
        .post(&format!("/approvals/{}/approve", request_id), &acting, json!({}))
        .await;
    assert_eq!(approved.status, StatusCode::FORBIDDEN);

    let request = app
        .get(&format!("/approvals/{}", request_id), &school.principal)
        .await;
    assert_eq!(request.body["status"], "PENDING");
}
