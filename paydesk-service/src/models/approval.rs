//! Dual-authorization requests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalType {
    InvoiceCancellation,
    BalanceAdjustment,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalType::InvoiceCancellation => "INVOICE_CANCELLATION",
            ApprovalType::BalanceAdjustment => "BALANCE_ADJUSTMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }
}

/// Proposed change to an invoice's billed amount.
///
/// `previous_total`/`previous_paid` snapshot the invoice when the request was
/// raised; approval only applies while the invoice still matches them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentProposal {
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub description: String,
    pub previous_total: Decimal,
    pub previous_paid: Decimal,
    pub new_total: Decimal,
    pub new_balance: Decimal,
}

impl AdjustmentProposal {
    pub fn new(
        invoice_id: Uuid,
        amount: Decimal,
        description: String,
        total_amount: Decimal,
        paid_amount: Decimal,
    ) -> Self {
        let new_total = total_amount + amount;
        Self {
            invoice_id,
            amount,
            description,
            previous_total: total_amount,
            previous_paid: paid_amount,
            new_total,
            new_balance: new_total - paid_amount,
        }
    }
}

/// Serialized description of the guarded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalPayload {
    InvoiceCancellation { invoice_id: Uuid },
    BalanceAdjustment(AdjustmentProposal),
}

impl ApprovalPayload {
    pub fn request_type(&self) -> ApprovalType {
        match self {
            ApprovalPayload::InvoiceCancellation { .. } => ApprovalType::InvoiceCancellation,
            ApprovalPayload::BalanceAdjustment(_) => ApprovalType::BalanceAdjustment,
        }
    }

    pub fn invoice_id(&self) -> Uuid {
        match self {
            ApprovalPayload::InvoiceCancellation { invoice_id } => *invoice_id,
            ApprovalPayload::BalanceAdjustment(proposal) => proposal.invoice_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub school_id: Uuid,
    pub request_type: ApprovalType,
    pub invoice_id: Uuid,
    pub payload: Json<ApprovalPayload>,
    pub reason: String,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub approved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub school_id: Uuid,
    pub payload: ApprovalPayload,
    pub reason: String,
    pub requested_by: String,
}

/// Resolution applied by a second administrator.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub status: ApprovalStatus,
    pub resolved_by: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListApprovalsFilter {
    pub status: Option<ApprovalStatus>,
    pub invoice_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_proposal_projects_totals() {
        let proposal = AdjustmentProposal::new(
            Uuid::new_v4(),
            Decimal::from(15000),
            "Late enrolment".to_string(),
            Decimal::from(20000),
            Decimal::from(5000),
        );
        assert_eq!(proposal.new_total, Decimal::from(35000));
        assert_eq!(proposal.new_balance, Decimal::from(30000));
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let invoice_id = Uuid::new_v4();
        let payload = ApprovalPayload::InvoiceCancellation { invoice_id };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "invoice_cancellation");
        assert_eq!(payload.request_type(), ApprovalType::InvoiceCancellation);
        assert_eq!(payload.invoice_id(), invoice_id);
    }
}
