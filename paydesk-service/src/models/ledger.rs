//! Per-student running ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Invoice, InvoiceStatus, Payment, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    // Declaration order is the tie-break order: charges before the credits settling them.
    Invoice,
    Payment,
}

/// Ledger line with running balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub reference_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub running_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentLedger {
    pub student_id: Uuid,
    pub entries: Vec<LedgerEntry>,
    pub current_balance: Decimal,
}

/// Merge a student's invoices and payments into a chronological ledger.
///
/// Cancelled invoices and payments that never completed are ignored. Invoice
/// entries add their billed total, payment entries subtract their amount.
pub fn build_ledger(student_id: Uuid, invoices: &[Invoice], payments: &[Payment]) -> StudentLedger {
    let mut events: Vec<(DateTime<Utc>, LedgerEntryType, Uuid, String, Decimal)> = invoices
        .iter()
        .filter(|invoice| invoice.status != InvoiceStatus::Cancelled)
        .map(|invoice| {
            (
                invoice.created_utc,
                LedgerEntryType::Invoice,
                invoice.invoice_id,
                format!("Invoice {}", invoice.invoice_number),
                invoice.total_amount,
            )
        })
        .collect();

    events.extend(
        payments
            .iter()
            .filter(|payment| payment.status == PaymentStatus::Completed)
            .map(|payment| {
                let description = match &payment.reference {
                    Some(reference) => format!("Payment via {} ({})", payment.method.as_str(), reference),
                    None => format!("Payment via {}", payment.method.as_str()),
                };
                (
                    payment.completed_utc.unwrap_or(payment.created_utc),
                    LedgerEntryType::Payment,
                    payment.payment_id,
                    description,
                    -payment.amount,
                )
            }),
    );

    events.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

    let mut running_balance = Decimal::ZERO;
    let entries: Vec<LedgerEntry> = events
        .into_iter()
        .map(|(date, entry_type, reference_id, description, amount)| {
            running_balance += amount;
            LedgerEntry {
                date,
                entry_type,
                reference_id,
                description,
                amount,
                running_balance,
            }
        })
        .collect();

    StudentLedger {
        student_id,
        entries,
        current_balance: running_balance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, hour, 0, 0).unwrap()
    }

    fn invoice(total: i64, created: DateTime<Utc>, status: InvoiceStatus) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            student_id: Uuid::nil(),
            academic_period_id: Uuid::new_v4(),
            invoice_number: "INV-2026-000001".to_string(),
            total_amount: Decimal::from(total),
            paid_amount: Decimal::ZERO,
            balance: Decimal::from(total),
            status,
            due_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            created_by: None,
            created_utc: created,
            cancelled_utc: None,
            items: Vec::new(),
        }
    }

    fn payment(amount: i64, completed: DateTime<Utc>, status: PaymentStatus) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            student_id: Uuid::nil(),
            invoice_id: None,
            amount: Decimal::from(amount),
            method: PaymentMethod::Cash,
            status,
            reference: None,
            phone_number: None,
            checkout_request_id: None,
            gateway_transaction_id: None,
            recorded_by: None,
            created_utc: completed - Duration::minutes(5),
            completed_utc: Some(completed),
        }
    }

    #[test]
    fn empty_history_has_zero_balance() {
        let ledger = build_ledger(Uuid::nil(), &[], &[]);
        assert!(ledger.entries.is_empty());
        assert_eq!(ledger.current_balance, Decimal::ZERO);
    }

    #[test]
    fn invoice_then_payment_runs_down_the_balance() {
        let invoices = vec![invoice(5000, at(8), InvoiceStatus::PartiallyPaid)];
        let payments = vec![payment(2000, at(9), PaymentStatus::Completed)];

        let ledger = build_ledger(Uuid::nil(), &invoices, &payments);

        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.entries[0].entry_type, LedgerEntryType::Invoice);
        assert_eq!(ledger.entries[0].amount, Decimal::from(5000));
        assert_eq!(ledger.entries[0].running_balance, Decimal::from(5000));
        assert_eq!(ledger.entries[1].entry_type, LedgerEntryType::Payment);
        assert_eq!(ledger.entries[1].amount, Decimal::from(-2000));
        assert_eq!(ledger.entries[1].running_balance, Decimal::from(3000));
        assert_eq!(ledger.current_balance, Decimal::from(3000));
    }

    #[test]
    fn identical_timestamps_put_charges_first() {
        let invoices = vec![invoice(1000, at(10), InvoiceStatus::Paid)];
        let payments = vec![payment(1000, at(10), PaymentStatus::Completed)];

        let ledger = build_ledger(Uuid::nil(), &invoices, &payments);

        assert_eq!(ledger.entries[0].entry_type, LedgerEntryType::Invoice);
        assert!(ledger
            .entries
            .iter()
            .all(|entry| entry.running_balance >= Decimal::ZERO));
        assert_eq!(ledger.current_balance, Decimal::ZERO);
    }

    #[test]
    fn cancelled_invoices_and_incomplete_payments_are_excluded() {
        let invoices = vec![
            invoice(4000, at(8), InvoiceStatus::Pending),
            invoice(9000, at(9), InvoiceStatus::Cancelled),
        ];
        let payments = vec![
            payment(1000, at(10), PaymentStatus::Completed),
            payment(500, at(11), PaymentStatus::Pending),
            payment(700, at(12), PaymentStatus::Failed),
        ];

        let ledger = build_ledger(Uuid::nil(), &invoices, &payments);

        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.current_balance, Decimal::from(3000));
    }

    #[test]
    fn replaying_entries_reproduces_every_running_balance() {
        let invoices = vec![
            invoice(3000, at(7), InvoiceStatus::Paid),
            invoice(4500, at(12), InvoiceStatus::PartiallyPaid),
        ];
        let payments = vec![
            payment(3000, at(9), PaymentStatus::Completed),
            payment(1200, at(13), PaymentStatus::Completed),
            payment(300, at(14), PaymentStatus::Completed),
        ];

        let ledger = build_ledger(Uuid::nil(), &invoices, &payments);

        let mut balance = Decimal::ZERO;
        for window in ledger.entries.windows(2) {
            assert!(window[0].date <= window[1].date);
        }
        for entry in &ledger.entries {
            balance += entry.amount;
            assert_eq!(entry.running_balance, balance);
        }
        let billed: Decimal = Decimal::from(3000 + 4500);
        let paid: Decimal = Decimal::from(3000 + 1200 + 300);
        assert_eq!(ledger.current_balance, billed - paid);
    }
}
