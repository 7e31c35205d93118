//! Platform administration: tenant schools and impersonation sessions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;

use crate::authz::{authorize, Capability, Principal};
use crate::dtos::admin::{CreateSchoolRequest, ImpersonationStartedResponse, StartImpersonationRequest};
use crate::dtos::ListResponse;
use crate::models::CreateSchool;
use crate::services::impersonation::StartImpersonation;
use crate::startup::AppState;
use crate::utils::ValidatedJson;

pub async fn create_school(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreateSchoolRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageSchools)?;

    let school = state
        .store
        .create_school(&CreateSchool {
            name: req.name.trim().to_string(),
            code: req.code.trim().to_ascii_uppercase(),
        })
        .await?;

    tracing::info!(
        school_id = %school.school_id,
        code = %school.code,
        created_by = %principal.user_id,
        "School created"
    );

    Ok((StatusCode::CREATED, Json(school)))
}

/// Every tenant school with its headline totals.
pub async fn list_schools(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageSchools)?;

    let summaries = state.store.list_school_summaries().await?;
    Ok(Json(ListResponse::from(summaries)))
}

pub async fn start_impersonation(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<StartImpersonationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ttl_minutes = req
        .ttl_minutes
        .unwrap_or_else(|| state.impersonation.max_minutes());

    let session = state
        .impersonation
        .start(
            state.store.as_ref(),
            &principal,
            StartImpersonation {
                target_user_id: req.target_user_id,
                target_school_id: req.target_school_id,
                target_role: req.target_role,
                reason: req.reason,
                ttl_minutes,
            },
            Utc::now(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ImpersonationStartedResponse::from(session)),
    ))
}

/// Audit trail of issued sessions, newest first.
pub async fn list_impersonations(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::Impersonate)?;

    let sessions = state.store.list_impersonations().await?;
    Ok(Json(ListResponse::from(sessions)))
}

pub async fn end_impersonation(
    State(state): State<AppState>,
    principal: Principal,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .impersonation
        .end(state.store.as_ref(), &principal, &token, Utc::now())
        .await?;

    Ok(Json(session))
}
