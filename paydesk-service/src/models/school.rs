//! Tenant schools.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct School {
    pub school_id: Uuid,
    pub name: String,
    pub code: String,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSchool {
    pub name: String,
    pub code: String,
}

/// Platform-level overview of one tenant school.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SchoolSummary {
    pub school_id: Uuid,
    pub name: String,
    pub code: String,
    pub student_count: i64,
    pub invoiced_total: Decimal,
    pub collected_total: Decimal,
    pub outstanding_total: Decimal,
}
