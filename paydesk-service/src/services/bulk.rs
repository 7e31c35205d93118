//! Bulk invoice generation for a period.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    FeeStructure, ListInvoicesFilter, ListStudentsFilter, NewInvoice, NewInvoiceItem, Student,
};
use crate::services::metrics::{BULK_GENERATION_TOTAL, INVOICES_TOTAL};
use crate::services::store::FeeStore;

#[derive(Debug, Clone)]
pub struct BulkGenerationRequest {
    pub school_id: Uuid,
    pub academic_period_id: Uuid,
    pub class_id: Option<Uuid>,
    pub due_date: NaiveDate,
    pub fee_structure_ids: Vec<Uuid>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkGenerationError {
    pub student_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkGenerationResult {
    pub created: u32,
    pub skipped: u32,
    pub failed: u32,
    pub errors: Vec<BulkGenerationError>,
    pub message: String,
}

enum StudentOutcome {
    Created,
    Skipped,
}

/// Items billed to one student: school-wide fees plus fees scoped to their class.
pub fn applicable_items(fees: &[FeeStructure], class_id: Uuid) -> Vec<NewInvoiceItem> {
    fees.iter()
        .filter(|fee| fee.applies_to(class_id))
        .map(|fee| NewInvoiceItem {
            description: fee.name.clone(),
            amount: fee.amount,
            category: fee.category,
            fee_structure_id: Some(fee.fee_structure_id),
        })
        .collect()
}

/// Validate the run and load the fee structures it bills.
async fn load_fee_structures(
    store: &dyn FeeStore,
    request: &BulkGenerationRequest,
    today: NaiveDate,
) -> Result<Vec<FeeStructure>, AppError> {
    if request.fee_structure_ids.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "At least one fee structure is required"
        )));
    }
    if request.due_date < today {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Due date {} is in the past",
            request.due_date
        )));
    }

    store
        .get_period(request.school_id, request.academic_period_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Academic period {} not found",
                request.academic_period_id
            ))
        })?;

    if let Some(class_id) = request.class_id {
        store
            .get_class(request.school_id, class_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Class {} not found", class_id)))?;
    }

    let requested: HashSet<Uuid> = request.fee_structure_ids.iter().copied().collect();
    let ids: Vec<Uuid> = requested.iter().copied().collect();
    let fees = store.get_fee_structures(request.school_id, &ids).await?;

    if fees.len() != requested.len() {
        let found: HashSet<Uuid> = fees.iter().map(|fee| fee.fee_structure_id).collect();
        let missing: Vec<String> = requested
            .difference(&found)
            .map(|id| id.to_string())
            .collect();
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Fee structures not found: {}",
            missing.join(", ")
        )));
    }

    if let Some(foreign) = fees
        .iter()
        .find(|fee| fee.academic_period_id != request.academic_period_id)
    {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Fee structure {} belongs to a different academic period",
            foreign.fee_structure_id
        )));
    }

    Ok(fees)
}

async fn generate_for_student(
    store: &dyn FeeStore,
    request: &BulkGenerationRequest,
    fees: &[FeeStructure],
    student: &Student,
    today: NaiveDate,
) -> Result<StudentOutcome, AppError> {
    let items = applicable_items(fees, student.class_id);
    if items.is_empty() {
        return Ok(StudentOutcome::Skipped);
    }

    let existing = store
        .list_invoices(
            request.school_id,
            &ListInvoicesFilter {
                student_id: Some(student.student_id),
                academic_period_id: Some(request.academic_period_id),
                ..Default::default()
            },
        )
        .await?;
    if !existing.is_empty() {
        return Ok(StudentOutcome::Skipped);
    }

    let invoice = NewInvoice {
        school_id: request.school_id,
        student_id: student.student_id,
        academic_period_id: request.academic_period_id,
        due_date: request.due_date,
        created_by: request.created_by.clone(),
        items,
    };

    match store.create_invoice(&invoice, today).await {
        Ok(_) => Ok(StudentOutcome::Created),
        // Lost a race with a concurrent run for the same student and period.
        Err(e) if e.is_conflict() => Ok(StudentOutcome::Skipped),
        Err(e) => Err(e),
    }
}

/// Invoice every active student in scope for the period.
///
/// Per-student failures are collected in the result; only request-level
/// validation failures abort the run.
#[instrument(skip(store, request), fields(school_id = %request.school_id, period_id = %request.academic_period_id))]
pub async fn generate_invoices(
    store: &dyn FeeStore,
    request: &BulkGenerationRequest,
    today: NaiveDate,
) -> Result<BulkGenerationResult, AppError> {
    let fees = load_fee_structures(store, request, today).await?;

    let students = store
        .list_students(
            request.school_id,
            &ListStudentsFilter {
                class_id: request.class_id,
                active: Some(true),
                parent_user_id: None,
            },
        )
        .await?;

    info!(
        students = students.len(),
        fee_structures = fees.len(),
        "Starting bulk invoice generation"
    );

    let mut result = BulkGenerationResult::default();

    for student in &students {
        match generate_for_student(store, request, &fees, student, today).await {
            Ok(StudentOutcome::Created) => {
                result.created += 1;
                BULK_GENERATION_TOTAL.with_label_values(&["created"]).inc();
                INVOICES_TOTAL.with_label_values(&["bulk"]).inc();
            }
            Ok(StudentOutcome::Skipped) => {
                result.skipped += 1;
                BULK_GENERATION_TOTAL.with_label_values(&["skipped"]).inc();
            }
            Err(e) => {
                warn!(student_id = %student.student_id, error = %e, "Invoice generation failed for student");
                result.failed += 1;
                BULK_GENERATION_TOTAL.with_label_values(&["failed"]).inc();
                result.errors.push(BulkGenerationError {
                    student_id: student.student_id,
                    error: e.to_string(),
                });
            }
        }
    }

    result.message = format!(
        "Generated {} invoices ({} skipped, {} failed)",
        result.created, result.skipped, result.failed
    );

    info!(
        created = result.created,
        skipped = result.skipped,
        failed = result.failed,
        "Bulk invoice generation finished"
    );

    Ok(result)
}
