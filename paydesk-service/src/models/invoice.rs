//! Invoice and invoice item models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::FeeCategory;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    PartiallyPaid,
    Paid,
    Cancelled,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::PartiallyPaid => "PARTIALLY_PAID",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Cancelled => "CANCELLED",
            InvoiceStatus::Overdue => "OVERDUE",
        }
    }

    /// PAID and CANCELLED accept no further amount changes from sweeps.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Pending | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
        )
    }
}

/// Derive the status of a non-cancelled invoice from its amounts and due date.
pub fn derive_status(
    current: InvoiceStatus,
    total_amount: Decimal,
    paid_amount: Decimal,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    if current == InvoiceStatus::Cancelled {
        return InvoiceStatus::Cancelled;
    }
    if total_amount - paid_amount <= Decimal::ZERO {
        InvoiceStatus::Paid
    } else if due_date < today {
        InvoiceStatus::Overdue
    } else if paid_amount > Decimal::ZERO {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Pending
    }
}

/// A billing document for one student for one academic period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub school_id: Uuid,
    pub student_id: Uuid,
    pub academic_period_id: Uuid,
    pub invoice_number: String,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub balance: Decimal,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub created_by: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
}

impl Invoice {
    /// Sum of the non-dismissed items, i.e. what the invoice should bill.
    pub fn items_total(&self) -> Decimal {
        sum_active_items(&self.items)
    }

    /// Recompute total, balance and status from the items and paid amount.
    pub fn recompute(&mut self, today: NaiveDate) {
        self.total_amount = self.items_total();
        self.balance = self.total_amount - self.paid_amount;
        self.status = derive_status(
            self.status,
            self.total_amount,
            self.paid_amount,
            self.due_date,
            today,
        );
    }

    /// Apply a completed payment to the invoice.
    pub fn apply_payment(&mut self, amount: Decimal, today: NaiveDate) {
        self.paid_amount += amount;
        self.balance = self.total_amount - self.paid_amount;
        self.status = derive_status(
            self.status,
            self.total_amount,
            self.paid_amount,
            self.due_date,
            today,
        );
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) {
        self.status = InvoiceStatus::Cancelled;
        self.cancelled_utc = Some(at);
    }
}

pub fn sum_active_items(items: &[InvoiceItem]) -> Decimal {
    items
        .iter()
        .filter(|item| !item.is_dismissed)
        .map(|item| item.amount)
        .sum()
}

/// Line on an invoice. Positive amounts are charges, negative amounts credits.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub category: FeeCategory,
    pub fee_structure_id: Option<Uuid>,
    pub is_dismissed: bool,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Input for a new invoice line.
#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub description: String,
    pub amount: Decimal,
    pub category: FeeCategory,
    pub fee_structure_id: Option<Uuid>,
}

/// Input for creating an invoice together with its items.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub school_id: Uuid,
    pub student_id: Uuid,
    pub academic_period_id: Uuid,
    pub due_date: NaiveDate,
    pub created_by: Option<String>,
    pub items: Vec<NewInvoiceItem>,
}

impl NewInvoice {
    pub fn total(&self) -> Decimal {
        self.items.iter().map(|item| item.amount).sum()
    }
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub student_id: Option<Uuid>,
    pub academic_period_id: Option<Uuid>,
}

/// Format the school-scoped invoice number.
pub fn format_invoice_number(year: i32, sequence: i64) -> String {
    format!("INV-{}-{:06}", year, sequence)
}
