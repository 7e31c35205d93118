use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::FeeCategory;

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePeriodRequest {
    #[validate(length(min = 1, max = 50, message = "Term is required"))]
    pub term: String,

    #[validate(range(min = 2000, max = 2100, message = "Academic year is out of range"))]
    pub academic_year: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateClassRequest {
    #[validate(length(min = 1, max = 100, message = "Class name is required"))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateStudentRequest {
    pub class_id: Uuid,

    #[validate(length(min = 1, max = 50, message = "Admission number is required"))]
    pub admission_number: String,

    #[validate(length(min = 1, max = 100, message = "First name is required"))]
    pub first_name: String,

    #[validate(length(min = 1, max = 100, message = "Last name is required"))]
    pub last_name: String,

    pub parent_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetStudentStatusRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateFeeStructureRequest {
    pub academic_period_id: Uuid,

    pub class_id: Option<Uuid>,

    #[validate(length(min = 1, max = 200, message = "Fee name is required"))]
    pub name: String,

    pub amount: Decimal,

    pub category: FeeCategory,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeeStructureQuery {
    pub academic_period_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct StudentStatusResponse {
    pub student_id: Uuid,
    pub active: bool,
}
