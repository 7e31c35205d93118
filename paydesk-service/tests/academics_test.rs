//! Integration tests for schools, academics and invoice maintenance.

mod common;

use axum::http::StatusCode;
use common::{
    amount, create_invoice, create_school, create_student, due_in, spawn_app, today, Caller,
};
use rust_decimal::Decimal;
use serde_json::json;

#[tokio::test]
async fn activating_a_period_deactivates_the_others() {
    let app = spawn_app();
    let school = create_school(&app, "ACA1").await;

    let response = app
        .post("/periods", &school.principal, json!({ "term": "Term 2", "academic_year": 2026 }))
        .await;
    let term_two = response.body["period_id"].as_str().unwrap().to_string();

    let response = app
        .post(&format!("/periods/{}/activate", term_two), &school.principal, json!({}))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let periods = app.get("/periods", &school.bursar).await;
    let active: Vec<_> = periods.body["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["is_active"] == true)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["period_id"], term_two.as_str());

    let missing = app
        .post(
            &format!("/periods/{}/activate", uuid::Uuid::new_v4()),
            &school.principal,
            json!({}),
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn identity_headers_are_required() {
    let app = spawn_app();
    let response = app.request("GET", "/invoices", None, None).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let no_school = Caller {
        user_id: "bursar-1".to_string(),
        role: "BURSAR",
        school_id: None,
        impersonation_token: None,
    };
    let response = app.get("/invoices", &no_school).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn school_codes_are_unique_and_summaries_add_up() {
    let app = spawn_app();
    let school = create_school(&app, "ACA2").await;

    let duplicate = app
        .post("/admin/schools", &Caller::super_admin(), json!({ "name": "Again", "code": "ACA2" }))
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let student_id = create_student(&app, &school, &school.class_id, "S-1", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 4000).await;
    app.post(
        "/payments",
        &school.bursar,
        json!({ "student_id": student_id, "invoice_id": invoice_id, "amount": "1500", "method": "CASH" }),
    )
    .await;

    let summaries = app.get("/admin/schools", &Caller::super_admin()).await;
    assert_eq!(summaries.status, StatusCode::OK);
    let summary = summaries.body["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["code"] == "ACA2")
        .unwrap();
    assert_eq!(summary["student_count"], 1);
    assert_eq!(amount(&summary["invoiced_total"]), Decimal::from(4000));
    assert_eq!(amount(&summary["collected_total"]), Decimal::from(1500));
    assert_eq!(amount(&summary["outstanding_total"]), Decimal::from(2500));

    let forbidden = app.get("/admin/schools", &school.principal).await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn dismissing_an_item_recomputes_the_total() {
    let app = spawn_app();
    let school = create_school(&app, "ACA3").await;
    let student_id = create_student(&app, &school, &school.class_id, "S-2", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 3000).await;

    let added = app
        .post(
            &format!("/invoices/{}/items", invoice_id),
            &school.bursar,
            json!({ "description": "Trip", "amount": "700", "category": "ACTIVITY" }),
        )
        .await;
    assert_eq!(added.status, StatusCode::OK, "{}", added.text);
    assert_eq!(amount(&added.body["total_amount"]), Decimal::from(3700));

    let trip = added.body["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["description"] == "Trip")
        .unwrap()["item_id"]
        .as_str()
        .unwrap()
        .to_string();

    let dismissed = app
        .post(
            &format!("/invoices/{}/items/{}/dismiss", invoice_id, trip),
            &school.bursar,
            json!({}),
        )
        .await;
    assert_eq!(dismissed.status, StatusCode::OK, "{}", dismissed.text);
    assert_eq!(amount(&dismissed.body["total_amount"]), Decimal::from(3000));
    assert_eq!(dismissed.body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_manual_invoice_conflicts() {
    let app = spawn_app();
    let school = create_school(&app, "ACA4").await;
    let student_id = create_student(&app, &school, &school.class_id, "S-3", None).await;
    create_invoice(&app, &school, &student_id, 1000).await;

    let response = app
        .post(
            "/invoices",
            &school.bursar,
            json!({
                "student_id": student_id,
                "academic_period_id": school.period_id,
                "due_date": due_in(10),
                "items": [{ "description": "Tuition", "amount": "1000" }],
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn overdue_sweep_moves_open_invoices_past_due() {
    let app = spawn_app();
    let school = create_school(&app, "ACA5").await;
    let student_id = create_student(&app, &school, &school.class_id, "S-4", None).await;
    let invoice_id = create_invoice(&app, &school, &student_id, 1000).await;

    let as_of = today() + chrono::Duration::days(31);
    let response = app
        .post(
            &format!("/invoices/overdue-sweep?as_of={}", as_of),
            &school.bursar,
            json!({}),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(response.body["updated"], 1);

    let invoice = app.get(&format!("/invoices/{}", invoice_id), &school.bursar).await;
    assert_eq!(invoice.body["status"], "OVERDUE");
}
