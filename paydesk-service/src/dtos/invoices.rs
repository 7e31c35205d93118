use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{FeeCategory, NewInvoiceItem};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InvoiceItemRequest {
    #[validate(length(min = 1, max = 200, message = "Item description is required"))]
    pub description: String,

    pub amount: Decimal,

    #[serde(default = "default_category")]
    pub category: FeeCategory,
}

fn default_category() -> FeeCategory {
    FeeCategory::Other
}

impl From<InvoiceItemRequest> for NewInvoiceItem {
    fn from(item: InvoiceItemRequest) -> Self {
        Self {
            description: item.description.trim().to_string(),
            amount: item.amount,
            category: item.category,
            fee_structure_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub student_id: Uuid,

    pub academic_period_id: Uuid,

    pub due_date: NaiveDate,

    #[validate(length(min = 1, message = "At least one item is required"), nested)]
    pub items: Vec<InvoiceItemRequest>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkGenerateRequest {
    pub academic_period_id: Uuid,

    pub class_id: Option<Uuid>,

    pub due_date: NaiveDate,

    #[validate(length(min = 1, message = "At least one fee structure is required"))]
    pub fee_structure_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelInvoiceRequest {
    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustBalanceRequest {
    pub amount: Decimal,

    #[serde(default)]
    pub description: String,

    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OverdueSweepQuery {
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct OverdueSweepResponse {
    pub as_of: NaiveDate,
    pub updated: u64,
}
