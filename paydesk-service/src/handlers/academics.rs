//! Academic periods, classes, students and fee structures.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize, role_has, Capability, Principal};
use crate::dtos::academics::{
    CreateClassRequest, CreateFeeStructureRequest, CreatePeriodRequest, CreateStudentRequest,
    FeeStructureQuery, SetStudentStatusRequest, StudentStatusResponse,
};
use crate::dtos::ListResponse;
use crate::handlers::visible_student;
use crate::models::{
    CreateAcademicPeriod, CreateFeeStructure, CreateSchoolClass, CreateStudent,
    ListStudentsFilter,
};
use crate::services::ledger;
use crate::startup::AppState;
use crate::utils::ValidatedJson;

async fn ensure_class(state: &AppState, school_id: Uuid, class_id: Uuid) -> Result<(), AppError> {
    state
        .store
        .get_class(school_id, class_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Class {} not found", class_id)))
}

// -----------------------------------------------------------------------------
// Academic periods
// -----------------------------------------------------------------------------

pub async fn create_period(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreatePeriodRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageAcademics)?;
    let school_id = principal.school_id()?;

    let period = state
        .store
        .create_period(&CreateAcademicPeriod {
            school_id,
            term: req.term.trim().to_string(),
            academic_year: req.academic_year,
        })
        .await?;

    tracing::info!(period_id = %period.period_id, label = %period.label(), "Academic period created");

    Ok((StatusCode::CREATED, Json(period)))
}

pub async fn list_periods(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ViewFinance)?;
    let periods = state.store.list_periods(principal.school_id()?).await?;
    Ok(Json(ListResponse::from(periods)))
}

/// Make a period the school's only active one.
pub async fn activate_period(
    State(state): State<AppState>,
    principal: Principal,
    Path(period_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageAcademics)?;
    let school_id = principal.school_id()?;

    let period = state
        .store
        .activate_period(school_id, period_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Academic period {} not found", period_id))
        })?;

    tracing::info!(period_id = %period_id, activated_by = %principal.user_id, "Academic period activated");

    Ok(Json(period))
}

// -----------------------------------------------------------------------------
// Classes
// -----------------------------------------------------------------------------

pub async fn create_class(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreateClassRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageAcademics)?;

    let class = state
        .store
        .create_class(&CreateSchoolClass {
            school_id: principal.school_id()?,
            name: req.name.trim().to_string(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(class)))
}

pub async fn list_classes(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ViewFinance)?;
    let classes = state.store.list_classes(principal.school_id()?).await?;
    Ok(Json(ListResponse::from(classes)))
}

// -----------------------------------------------------------------------------
// Students
// -----------------------------------------------------------------------------

pub async fn create_student(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreateStudentRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageStudents)?;
    let school_id = principal.school_id()?;
    ensure_class(&state, school_id, req.class_id).await?;

    let student = state
        .store
        .create_student(&CreateStudent {
            school_id,
            class_id: req.class_id,
            admission_number: req.admission_number.trim().to_string(),
            first_name: req.first_name.trim().to_string(),
            last_name: req.last_name.trim().to_string(),
            parent_user_id: req
                .parent_user_id
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        })
        .await?;

    tracing::info!(student_id = %student.student_id, admission_number = %student.admission_number, "Student enrolled");

    Ok((StatusCode::CREATED, Json(student)))
}

/// Staff see every student; parents only their own children.
pub async fn list_students(
    State(state): State<AppState>,
    principal: Principal,
    Query(mut filter): Query<ListStudentsFilter>,
) -> Result<impl IntoResponse, AppError> {
    if !role_has(principal.role, Capability::ViewFinance) {
        authorize(&principal, Capability::ViewOwnChildren)?;
        filter.parent_user_id = Some(principal.user_id.clone());
    }

    let students = state
        .store
        .list_students(principal.school_id()?, &filter)
        .await?;
    Ok(Json(ListResponse::from(students)))
}

pub async fn get_student(
    State(state): State<AppState>,
    principal: Principal,
    Path(student_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let student = visible_student(state.store.as_ref(), &principal, student_id).await?;
    Ok(Json(student))
}

pub async fn set_student_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(student_id): Path<Uuid>,
    Json(req): Json<SetStudentStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageStudents)?;

    let student = state
        .store
        .set_student_active(principal.school_id()?, student_id, req.active)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student {} not found", student_id)))?;

    tracing::info!(student_id = %student_id, active = req.active, "Student status changed");

    Ok(Json(StudentStatusResponse {
        student_id: student.student_id,
        active: student.active,
    }))
}

/// Chronological invoices and payments with running balance.
pub async fn student_ledger(
    State(state): State<AppState>,
    principal: Principal,
    Path(student_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let student = visible_student(state.store.as_ref(), &principal, student_id).await?;
    let ledger = ledger::student_ledger(state.store.as_ref(), &student).await?;
    Ok(Json(ledger))
}

// -----------------------------------------------------------------------------
// Fee structures
// -----------------------------------------------------------------------------

pub async fn create_fee_structure(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(req): ValidatedJson<CreateFeeStructureRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ManageFees)?;
    let school_id = principal.school_id()?;

    if req.amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Fee amount must be greater than zero"
        )));
    }
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
    if let Some(class_id) = req.class_id {
        ensure_class(&state, school_id, class_id).await?;
    }

    let fee = state
        .store
        .create_fee_structure(&CreateFeeStructure {
            school_id,
            academic_period_id: req.academic_period_id,
            class_id: req.class_id,
            name: req.name.trim().to_string(),
            amount: req.amount,
            category: req.category,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(fee)))
}

pub async fn list_fee_structures(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<FeeStructureQuery>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&principal, Capability::ViewFinance)?;
    let fees = state
        .store
        .list_fee_structures(principal.school_id()?, query.academic_period_id)
        .await?;
    Ok(Json(ListResponse::from(fees)))
}
