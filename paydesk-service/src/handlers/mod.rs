pub mod academics;
pub mod admin;
pub mod approvals;
pub mod exports;
pub mod health;
pub mod invoices;
pub mod payments;

use service_core::error::AppError;
use uuid::Uuid;

use crate::authz::{authorize_student_view, Principal};
use crate::models::Student;
use crate::services::FeeStore;

/// Load a student of the caller's school that the caller may see.
pub(crate) async fn visible_student(
    store: &dyn FeeStore,
    principal: &Principal,
    student_id: Uuid,
) -> Result<Student, AppError> {
    let school_id = principal.school_id()?;
    let student = store
        .get_student(school_id, student_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Student {} not found", student_id)))?;
    authorize_student_view(principal, student.parent_user_id.as_deref())?;
    Ok(student)
}
