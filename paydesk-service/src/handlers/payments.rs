//! Manual payments, STK push initiation and the gateway callback.

use std::collections::HashSet;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize, role_has, Capability, Principal};
use crate::dtos::payments::{CallbackResponse, RecordPaymentRequest, StkPushRequestBody};
use crate::dtos::ListResponse;
use crate::handlers::visible_student;
use crate::models::{ListPaymentsFilter, ListStudentsFilter};
use crate::services::payments::{
    self, verify_callback_signature, GatewayCallback, ManualPayment, StkPushInput,
};
use crate::startup::AppState;
use crate::utils::ValidatedJson;

pub const CALLBACK_SIGNATURE_HEADER: &str = "x-callback-signature";

pub async fn record_payment(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<RecordPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::RecordPayments)?;
    let student = visible_student(state.store.as_ref(), &principal, req.student_id).await?;

    let payment = payments::record_payment(
        state.store.as_ref(),
        state.notifier.as_ref(),
        &student,
        ManualPayment {
            invoice_id: req.invoice_id,
            amount: req.amount,
            method: req.method,
            reference: req.reference,
            recorded_by: principal.user_id.clone(),
        },
        Utc::now().date_naive(),
    )
    .await?;

    tracing::info!(
        payment_id = %payment.payment_id,
        student_id = %payment.student_id,
        method = payment.method.as_str(),
        amount = %payment.amount,
        "Payment recorded"
    );

    Ok((StatusCode::CREATED, Json(payment)))
}

/// Staff see the school's payments; parents only their children's.
pub async fn list_payments(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ListPaymentsFilter>,
) -> Result<impl IntoResponse, AppError> {
    let school_id = principal.school_id()?;
    let mut payments = state.store.list_payments(school_id, &filter).await?;

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
        payments.retain(|payment| children.contains(&payment.student_id));
    }

    Ok(Json(ListResponse::from(payments)))
}

/// Prompt the payer's phone; the result arrives through the callback.
pub async fn stk_push(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<StkPushRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::InitiateMobilePayment)?;
    let student = visible_student(state.store.as_ref(), &principal, req.student_id).await?;

    let payment = payments::initiate_stk_push(
        state.store.as_ref(),
        state.gateway.as_ref(),
        &student,
        StkPushInput {
            invoice_id: req.invoice_id,
            phone_number: req.phone_number,
            amount: req.amount,
            initiated_by: principal.user_id.clone(),
        },
        Utc::now().date_naive(),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(payment)))
}

/// Gateway result callback. Not tied to a caller identity; authenticated by
/// signature when a callback secret is configured.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    if let Some(secret) = state.callback_secret() {
        let signature = headers
            .get(CALLBACK_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        verify_callback_signature(secret, &body, signature)?;
    }

    let callback: GatewayCallback = serde_json::from_slice(&body).map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!("Invalid callback payload: {}", e))
    })?;

    let (payment, outcome) = payments::reconcile_callback(
        state.store.as_ref(),
        state.notifier.as_ref(),
        &callback,
        Utc::now(),
    )
    .await?;

    tracing::info!(
        checkout_request_id = %callback.checkout_request_id,
        payment_id = %payment.payment_id,
        outcome = outcome.as_str(),
        "Gateway callback reconciled"
    );

    Ok(Json(CallbackResponse { outcome, payment }))
}
