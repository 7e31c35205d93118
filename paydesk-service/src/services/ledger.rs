//! Student ledger assembly.

use service_core::error::AppError;
use tracing::instrument;

use crate::models::{build_ledger, ListInvoicesFilter, ListPaymentsFilter, Student, StudentLedger};
use crate::services::store::FeeStore;

/// Chronological invoice/payment history of one student with running balance.
#[instrument(skip(store, student), fields(student_id = %student.student_id))]
pub async fn student_ledger(
    store: &dyn FeeStore,
    student: &Student,
) -> Result<StudentLedger, AppError> {
    let invoices = store
        .list_invoices(
            student.school_id,
            &ListInvoicesFilter {
                student_id: Some(student.student_id),
                ..Default::default()
            },
        )
        .await?;
    let payments = store
        .list_payments(
            student.school_id,
            &ListPaymentsFilter {
                student_id: Some(student.student_id),
                ..Default::default()
            },
        )
        .await?;

    Ok(build_ledger(student.student_id, &invoices, &payments))
}
