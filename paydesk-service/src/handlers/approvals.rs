//! Dual-authorization queue.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize, role_has, Capability, Principal};
use crate::dtos::approvals::ResolveApprovalRequest;
use crate::dtos::ListResponse;
use crate::models::ListApprovalsFilter;
use crate::services::store::approval_not_found;
use crate::startup::AppState;
use crate::utils::ValidatedJson;

/// Requesters and approvers both read the queue.
fn authorize_queue_read(principal: &Principal) -> Result<(), AppError> {
    if role_has(principal.role, Capability::ResolveApproval) {
        return Ok(());
    }
    authorize(principal, Capability::RequestApproval)
}

pub async fn list_approvals(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ListApprovalsFilter>,
) -> Result<impl IntoResponse, AppError> {
    authorize_queue_read(&principal)?;

    let requests = state
        .store
        .list_approvals(principal.school_id()?, &filter)
        .await?;
    Ok(Json(ListResponse::from(requests)))
}

pub async fn get_approval(
    State(state): State<AppState>,
    principal: Principal,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    authorize_queue_read(&principal)?;

    let request = state
        .store
        .get_approval(principal.school_id()?, request_id)
        .await?
        .ok_or_else(|| approval_not_found(request_id))?;
    Ok(Json(request))
}

pub async fn approve(
    State(state): State<AppState>,
    principal: Principal,
    Path(request_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ResolveApprovalRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ResolveApproval)?;

    let request = state
        .approvals
        .approve(
            state.store.as_ref(),
            state.notifier.as_ref(),
            &principal,
            request_id,
            req.note,
            Utc::now(),
        )
        .await?;
    Ok(Json(request))
}

pub async fn reject(
    State(state): State<AppState>,
    principal: Principal,
    Path(request_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ResolveApprovalRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ResolveApproval)?;

    let request = state
        .approvals
        .reject(
            state.store.as_ref(),
            state.notifier.as_ref(),
            &principal,
            request_id,
            req.note,
            Utc::now(),
        )
        .await?;
    Ok(Json(request))
}
