use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{CallbackOutcome, Payment, PaymentMethod};

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    pub student_id: Uuid,

    pub invoice_id: Option<Uuid>,

    pub amount: Decimal,

    pub method: PaymentMethod,

    #[validate(length(max = 100, message = "Reference is too long"))]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StkPushRequestBody {
    pub student_id: Uuid,

    pub invoice_id: Uuid,

    #[validate(length(min = 9, max = 20, message = "Phone number is required"))]
    pub phone_number: String,

    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub outcome: CallbackOutcome,
    pub payment: Payment,
}
