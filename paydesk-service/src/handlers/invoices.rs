//! Invoice entry, line-item maintenance, bulk generation and approval-guarded changes.

use std::collections::HashSet;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize, role_has, Capability, Principal};
use crate::dtos::invoices::{
    AdjustBalanceRequest, BulkGenerateRequest, CancelInvoiceRequest, CreateInvoiceRequest,
    InvoiceItemRequest, OverdueSweepQuery, OverdueSweepResponse,
};
use crate::dtos::ListResponse;
use crate::handlers::visible_student;
use crate::models::{Invoice, ListInvoicesFilter, ListStudentsFilter, NewInvoice, NewInvoiceItem};
use crate::services::bulk::{generate_invoices, BulkGenerationRequest};
use crate::services::metrics::INVOICES_TOTAL;
use crate::services::store::invoice_not_found;
use crate::services::AdjustmentOutcome;
use crate::startup::AppState;
use crate::utils::ValidatedJson;

fn ensure_non_zero(item: &InvoiceItemRequest) -> Result<(), AppError> {
    if item.amount.is_zero() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Item '{}' has a zero amount",
            item.description
        )));
    }
    Ok(())
}

/// Manually raise an invoice for one student.
pub async fn create_invoice(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageInvoices)?;
    let school_id = principal.school_id()?;

    for item in &req.items {
        ensure_non_zero(item)?;
    }
    let items: Vec<NewInvoiceItem> = req.items.into_iter().map(NewInvoiceItem::from).collect();
    let input = NewInvoice {
        school_id,
        student_id: req.student_id,
        academic_period_id: req.academic_period_id,
        due_date: req.due_date,
        created_by: Some(principal.user_id.clone()),
        items,
    };
    if input.total() <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice total must be greater than zero"
        )));
    }

    visible_student(state.store.as_ref(), &principal, req.student_id).await?;
    state
        .store
        .get_period(school_id, req.academic_period_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Academic period {} not found",
                req.academic_period_id
            ))
        })?;

    let invoice = state
        .store
        .create_invoice(&input, Utc::now().date_naive())
        .await?;

    INVOICES_TOTAL.with_label_values(&["manual"]).inc();
    tracing::info!(
        invoice_id = %invoice.invoice_id,
        invoice_number = %invoice.invoice_number,
        total = %invoice.total_amount,
        "Invoice created"
    );

    Ok((StatusCode::CREATED, Json(invoice)))
}

/// Staff see the school's invoices; parents only their children's.
pub async fn list_invoices(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ListInvoicesFilter>,
) -> Result<impl IntoResponse, AppError> {
    let school_id = principal.school_id()?;
    let mut invoices = state.store.list_invoices(school_id, &filter).await?;

    if !role_has(principal.role, Capability::ViewFinance) {
        authorize(&principal, Capability::ViewOwnChildren)?;
        let children: HashSet<Uuid> = state
            .store
            .list_students(
                school_id,
                &ListStudentsFilter {
                    parent_user_id: Some(principal.user_id.clone()),
                    ..Default::default()
                },
            )
            .await?
            .into_iter()
            .map(|s| s.student_id)
            .collect();
        invoices.retain(|invoice| children.contains(&invoice.student_id));
    }

    Ok(Json(ListResponse::from(invoices)))
}

async fn load_invoice(state: &AppState, principal: &Principal, invoice_id: Uuid) -> Result<Invoice, AppError> {
    let invoice = state
        .store
        .get_invoice(principal.school_id()?, invoice_id)
        .await?
        .ok_or_else(|| invoice_not_found(invoice_id))?;
    visible_student(state.store.as_ref(), principal, invoice.student_id).await?;
    Ok(invoice)
}

pub async fn get_invoice(
    State(state): State<AppState>,
    principal: Principal,
    Path(invoice_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = load_invoice(&state, &principal, invoice_id).await?;
    Ok(Json(invoice))
}

pub async fn add_item(
    State(state): State<AppState>,
    principal: Principal,
    Path(invoice_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<InvoiceItemRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageInvoices)?;
    ensure_non_zero(&req)?;

    let invoice = state
        .approvals
        .add_item(
            state.store.as_ref(),
            &principal,
            invoice_id,
            &NewInvoiceItem::from(req),
            Utc::now().date_naive(),
        )
        .await?;

    tracing::info!(invoice_id = %invoice_id, total = %invoice.total_amount, "Invoice item added");

    Ok(Json(invoice))
}

/// Exclude an item from the total; the row is kept for audit.
pub async fn dismiss_item(
    State(state): State<AppState>,
    principal: Principal,
    Path((invoice_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageInvoices)?;

    let invoice = state
        .approvals
        .dismiss_item(
            state.store.as_ref(),
            &principal,
            invoice_id,
            item_id,
            Utc::now().date_naive(),
        )
        .await?;

    tracing::info!(invoice_id = %invoice_id, item_id = %item_id, total = %invoice.total_amount, "Invoice item dismissed");

    Ok(Json(invoice))
}

/// Raise a cancellation request; the invoice changes only once approved.
pub async fn request_cancellation(
    State(state): State<AppState>,
    principal: Principal,
    Path(invoice_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CancelInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::RequestApproval)?;

    let request = state
        .approvals
        .request_cancellation(state.store.as_ref(), &principal, invoice_id, &req.reason)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// Apply a small adjustment directly, or park a large one for approval.
pub async fn adjust_balance(
    State(state): State<AppState>,
    principal: Principal,
    Path(invoice_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<AdjustBalanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::RequestApproval)?;

    let outcome = state
        .approvals
        .adjust_balance(
            state.store.as_ref(),
            &principal,
            invoice_id,
            req.amount,
            &req.description,
            &req.reason,
            Utc::now().date_naive(),
        )
        .await?;

    let status = match outcome {
        AdjustmentOutcome::Applied { .. } => StatusCode::OK,
        AdjustmentOutcome::PendingApproval { .. } => StatusCode::ACCEPTED,
    };

    Ok((status, Json(outcome)))
}

pub async fn bulk_generate(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<BulkGenerateRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageInvoices)?;

    let request = BulkGenerationRequest {
        school_id: principal.school_id()?,
        academic_period_id: req.academic_period_id,
        class_id: req.class_id,
        due_date: req.due_date,
        fee_structure_ids: req.fee_structure_ids,
        created_by: Some(principal.user_id.clone()),
    };

    let result = generate_invoices(state.store.as_ref(), &request, Utc::now().date_naive()).await?;

    Ok(Json(result))
}

/// Move open invoices past their due date to OVERDUE.
pub async fn overdue_sweep(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<OverdueSweepQuery>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageInvoices)?;

    let as_of = query.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let updated = state
        .store
        .mark_overdue(principal.school_id()?, as_of)
        .await?;

    tracing::info!(as_of = %as_of, updated = updated, "Overdue sweep finished");

    Ok(Json(OverdueSweepResponse { as_of, updated }))
}
