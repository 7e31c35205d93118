//! Academic periods, classes, students and fee structures.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Fee type of a fee structure or invoice line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeCategory {
    Tuition,
    Boarding,
    Transport,
    Meals,
    Activity,
    Uniform,
    Exam,
    Adjustment,
    Other,
}

impl FeeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeCategory::Tuition => "TUITION",
            FeeCategory::Boarding => "BOARDING",
            FeeCategory::Transport => "TRANSPORT",
            FeeCategory::Meals => "MEALS",
            FeeCategory::Activity => "ACTIVITY",
            FeeCategory::Uniform => "UNIFORM",
            FeeCategory::Exam => "EXAM",
            FeeCategory::Adjustment => "ADJUSTMENT",
            FeeCategory::Other => "OTHER",
        }
    }
}

/// A school's term/year billing cycle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AcademicPeriod {
    pub period_id: Uuid,
    pub school_id: Uuid,
    pub term: String,
    pub academic_year: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl AcademicPeriod {
    pub fn label(&self) -> String {
        format!("{} {}", self.term, self.academic_year)
    }
}

#[derive(Debug, Clone)]
pub struct CreateAcademicPeriod {
    pub school_id: Uuid,
    pub term: String,
    pub academic_year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SchoolClass {
    pub class_id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSchoolClass {
    pub school_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub student_id: Uuid,
    pub school_id: Uuid,
    pub class_id: Uuid,
    pub admission_number: String,
    pub first_name: String,
    pub last_name: String,
    pub parent_user_id: Option<String>,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone)]
pub struct CreateStudent {
    pub school_id: Uuid,
    pub class_id: Uuid,
    pub admission_number: String,
    pub first_name: String,
    pub last_name: String,
    pub parent_user_id: Option<String>,
}

/// Filter parameters for listing students.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListStudentsFilter {
    pub class_id: Option<Uuid>,
    pub active: Option<bool>,
    pub parent_user_id: Option<String>,
}

/// A named, priced billable item template, optionally scoped to a class.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeeStructure {
    pub fee_structure_id: Uuid,
    pub school_id: Uuid,
    pub academic_period_id: Uuid,
    pub class_id: Option<Uuid>,
    pub name: String,
    pub amount: Decimal,
    pub category: FeeCategory,
    pub created_utc: DateTime<Utc>,
}

impl FeeStructure {
    /// School-wide items apply to every class, scoped items only to their own.
    pub fn applies_to(&self, class_id: Uuid) -> bool {
        self.class_id.map_or(true, |scoped| scoped == class_id)
    }
}

#[derive(Debug, Clone)]
pub struct CreateFeeStructure {
    pub school_id: Uuid,
    pub academic_period_id: Uuid,
    pub class_id: Option<Uuid>,
    pub name: String,
    pub amount: Decimal,
    pub category: FeeCategory,
}
