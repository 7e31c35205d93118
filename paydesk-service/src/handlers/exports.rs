//! Read-only CSV downloads of a school's data.

use std::collections::HashMap;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize, Capability, Principal};
use crate::models::{ListInvoicesFilter, ListPaymentsFilter, ListStudentsFilter};
use crate::services::export;
use crate::startup::AppState;

fn csv_response(filename: &'static str, body: String) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
}

pub async fn invoices_csv(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ExportData)?;
    let school_id = principal.school_id()?;

    let invoices = state
        .store
        .list_invoices(school_id, &ListInvoicesFilter::default())
        .await?;
    let students = state
        .store
        .list_students(school_id, &ListStudentsFilter::default())
        .await?;

    tracing::info!(rows = invoices.len(), exported_by = %principal.user_id, "Invoice export");

    Ok(csv_response(
        "invoices.csv",
        export::invoices_csv(&invoices, &students),
    ))
}

pub async fn payments_csv(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ExportData)?;
    let school_id = principal.school_id()?;

    let payments = state
        .store
        .list_payments(school_id, &ListPaymentsFilter::default())
        .await?;
    let students = state
        .store
        .list_students(school_id, &ListStudentsFilter::default())
        .await?;

    tracing::info!(rows = payments.len(), exported_by = %principal.user_id, "Payment export");

    Ok(csv_response(
        "payments.csv",
        export::payments_csv(&payments, &students),
    ))
}

pub async fn students_csv(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ExportData)?;
    let school_id = principal.school_id()?;

    let students = state
        .store
        .list_students(school_id, &ListStudentsFilter::default())
        .await?;
    let class_names: HashMap<Uuid, String> = state
        .store
        .list_classes(school_id)
        .await?
        .into_iter()
        .map(|c| (c.class_id, c.name))
        .collect();

    tracing::info!(rows = students.len(), exported_by = %principal.user_id, "Student export");

    Ok(csv_response(
        "students.csv",
        export::students_csv(&students, &class_names),
    ))
}
