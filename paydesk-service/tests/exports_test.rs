//! Integration tests for CSV exports.

mod common;

use axum::http::StatusCode;
use common::{create_invoice, create_school, create_student, spawn_app, Caller};
use serde_json::json;

#[tokio::test]
async fn invoice_export_lists_every_invoice() {
    let app = spawn_app();
    let school = create_school(&app, "EXP1").await;
    let first = create_student(&app, &school, &school.class_id, "E-1", None).await;
    let second = create_student(&app, &school, &school.class_id, "E-2", None).await;
    create_invoice(&app, &school, &first, 1000).await;
    create_invoice(&app, &school, &second, 2000).await;

    let response = app.get("/exports/invoices.csv", &school.bursar).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response
        .content_type
        .as_deref()
        .unwrap_or("")
        .starts_with("text/csv"));

    let lines: Vec<&str> = response.text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("invoice_number"));
    assert!(response.text.contains("E-1"));
    assert!(response.text.contains("E-2"));
}

#[tokio::test]
async fn student_export_quotes_awkward_values() {
    let app = spawn_app();
    let school = create_school(&app, "EXP2").await;

    let response = app
        .post(
            "/students",
            &school.bursar,
            json!({
                "class_id": school.class_id,
                "admission_number": "E-3",
                "first_name": "Wanjiru",
                "last_name": "O'Neil, Jr",
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);

    let export = app.get("/exports/students.csv", &school.principal).await;
    assert_eq!(export.status, StatusCode::OK);
    assert!(export.text.contains("\"O'Neil, Jr\""));
    assert!(export.text.contains("Grade 4"));
}

#[tokio::test]
async fn exports_require_the_export_capability() {
    let app = spawn_app();
    let school = create_school(&app, "EXP3").await;
    let teacher = Caller::in_school("teacher-1", "TEACHER", &school.school_id);

    let response = app.get("/exports/payments.csv", &teacher).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = app.get("/exports/payments.csv", &school.bursar).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text.lines().count(), 1);
}
