//! Integration tests for bulk invoice generation.

mod common;

use axum::http::StatusCode;
use common::{
    amount, create_class, create_fee, create_school, create_student, due_in, spawn_app,
};
use rust_decimal::Decimal;
use serde_json::json;

#[tokio::test]
async fn class_scoped_fees_reach_only_their_class() {
    let app = spawn_app();
    let school = create_school(&app, "BLK1").await;
    let class_y = create_class(&app, &school.principal, "Grade 5").await;

    let in_x = create_student(&app, &school, &school.class_id, "X-1", None).await;
    let in_y = create_student(&app, &school, &class_y, "Y-1", None).await;

    let school_wide = create_fee(&app, &school, "Tuition", 1000, None).await;
    let scoped = create_fee(&app, &school, "Lab levy", 500, Some(&school.class_id)).await;

    let response = app
        .post(
            "/invoices/bulk",
            &school.bursar,
            json!({
                "academic_period_id": school.period_id,
                "due_date": due_in(14),
                "fee_structure_ids": [school_wide, scoped],
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(response.body["created"], 2);
    assert_eq!(response.body["skipped"], 0);
    assert_eq!(response.body["failed"], 0);

    let x_invoices = app
        .get(&format!("/invoices?student_id={}", in_x), &school.bursar)
        .await;
    assert_eq!(amount(&x_invoices.body["items"][0]["total_amount"]), Decimal::from(1500));
    assert_eq!(x_invoices.body["items"][0]["status"], "PENDING");

    let y_invoices = app
        .get(&format!("/invoices?student_id={}", in_y), &school.bursar)
        .await;
    assert_eq!(amount(&y_invoices.body["items"][0]["total_amount"]), Decimal::from(1000));
    assert_eq!(amount(&y_invoices.body["items"][0]["balance"]), Decimal::from(1000));
}

#[tokio::test]
async fn rerunning_skips_students_already_invoiced() {
    let app = spawn_app();
    let school = create_school(&app, "BLK2").await;
    create_student(&app, &school, &school.class_id, "A-1", None).await;
    create_student(&app, &school, &school.class_id, "A-2", None).await;
    let fee = create_fee(&app, &school, "Tuition", 800, None).await;

    let body = json!({
        "academic_period_id": school.period_id,
        "due_date": due_in(14),
        "fee_structure_ids": [fee],
    });

    let first = app.post("/invoices/bulk", &school.bursar, body.clone()).await;
    assert_eq!(first.body["created"], 2);

    let second = app.post("/invoices/bulk", &school.bursar, body).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["created"], 0);
    assert_eq!(second.body["skipped"], 2);
}

#[tokio::test]
async fn concurrent_runs_create_one_invoice_per_student() {
    let app = spawn_app();
    let school = create_school(&app, "BLK3").await;
    for n in 0..5 {
        create_student(&app, &school, &school.class_id, &format!("C-{}", n), None).await;
    }
    let fee = create_fee(&app, &school, "Tuition", 1200, None).await;

    let body = json!({
        "academic_period_id": school.period_id,
        "due_date": due_in(14),
        "fee_structure_ids": [fee],
    });

    let (a, b) = tokio::join!(
        app.post("/invoices/bulk", &school.bursar, body.clone()),
        app.post("/invoices/bulk", &school.bursar, body.clone()),
    );

    let created = a.body["created"].as_u64().unwrap() + b.body["created"].as_u64().unwrap();
    let skipped = a.body["skipped"].as_u64().unwrap() + b.body["skipped"].as_u64().unwrap();
    assert_eq!(created, 5);
    assert_eq!(skipped, 5);

    let invoices = app.get("/invoices", &school.bursar).await;
    assert_eq!(invoices.body["total"], 5);
}

#[tokio::test]
async fn inactive_students_are_not_billed() {
    let app = spawn_app();
    let school = create_school(&app, "BLK4").await;
    let active = create_student(&app, &school, &school.class_id, "I-1", None).await;
    let inactive = create_student(&app, &school, &school.class_id, "I-2", None).await;
    let fee = create_fee(&app, &school, "Tuition", 900, None).await;

    let response = app
        .request(
            "PATCH",
            &format!("/students/{}/status", inactive),
            Some(&school.bursar),
            Some(json!({ "active": false })),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = app
        .post(
            "/invoices/bulk",
            &school.bursar,
            json!({
                "academic_period_id": school.period_id,
                "due_date": due_in(7),
                "fee_structure_ids": [fee],
            }),
        )
        .await;
    assert_eq!(response.body["created"], 1);

    let invoices = app.get("/invoices", &school.bursar).await;
    assert_eq!(invoices.body["items"][0]["student_id"], active.as_str());
}

#[tokio::test]
async fn invalid_runs_are_rejected_up_front() {
    let app = spawn_app();
    let school = create_school(&app, "BLK5").await;
    let fee = create_fee(&app, &school, "Tuition", 900, None).await;

    let past_due = app
        .post(
            "/invoices/bulk",
            &school.bursar,
            json!({
                "academic_period_id": school.period_id,
                "due_date": due_in(-1),
                "fee_structure_ids": [fee],
            }),
        )
        .await;
    assert_eq!(past_due.status, StatusCode::BAD_REQUEST);

    let no_fees = app
        .post(
            "/invoices/bulk",
            &school.bursar,
            json!({
                "academic_period_id": school.period_id,
                "due_date": due_in(7),
                "fee_structure_ids": [],
            }),
        )
        .await;
    assert_eq!(no_fees.status, StatusCode::UNPROCESSABLE_ENTITY);

    let other = create_school(&app, "BLK6").await;
    let foreign_fee = app
        .post(
            "/invoices/bulk",
            &other.bursar,
            json!({
                "academic_period_id": other.period_id,
                "due_date": due_in(7),
                "fee_structure_ids": [fee],
            }),
        )
        .await;
    assert_eq!(foreign_fee.status, StatusCode::NOT_FOUND);

    let teacher = common::Caller::in_school("teacher-1", "TEACHER", &school.school_id);
    let forbidden = app
        .post(
            "/invoices/bulk",
            &teacher,
            json!({
                "academic_period_id": school.period_id,
                "due_date": due_in(7),
                "fee_structure_ids": [fee],
            }),
        )
        .await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
}
