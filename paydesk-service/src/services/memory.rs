//! In-process fee store.
//!
//! Holds every table behind one async mutex, so each operation is a single
//! serialized unit of work with the same uniqueness and conditional-write
//! guarantees as the PostgreSQL store. Used by the integration tests and by
//! `STORAGE_BACKEND=memory` local runs.

use crate::models::{
    derive_status, format_invoice_number, AcademicPeriod, ApprovalDecision, ApprovalPayload,
    ApprovalRequest, ApprovalStatus, CallbackOutcome, CreateAcademicPeriod, CreateFeeStructure,
    CreateSchool, CreateSchoolClass, CreateStudent, FeeCategory, FeeStructure,
    ImpersonationSession, Invoice, InvoiceItem, InvoiceStatus, ListApprovalsFilter,
    ListInvoicesFilter, ListPaymentsFilter, ListStudentsFilter, NewApprovalRequest,
    NewImpersonationSession, NewInvoice, NewInvoiceItem, NewPayment, Payment, PaymentStatus,
    School, SchoolClass, SchoolSummary, Student,
};
use crate::services::store::{
    approval_already_resolved, approval_not_found, checkout_not_found, invoice_cancelled,
    invoice_not_found, proposal_outdated, FeeStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::types::Json;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct SchoolRecord {
    school: School,
    invoice_sequence: i64,
}

#[derive(Default)]
struct Tables {
    schools: Vec<SchoolRecord>,
    periods: Vec<AcademicPeriod>,
    classes: Vec<SchoolClass>,
    students: Vec<Student>,
    fee_structures: Vec<FeeStructure>,
    invoices: Vec<Invoice>,
    payments: Vec<Payment>,
    approvals: Vec<ApprovalRequest>,
    sessions: Vec<ImpersonationSession>,
}

impl Tables {
    fn invoice_mut(&mut self, school_id: Uuid, invoice_id: Uuid) -> Result<&mut Invoice, AppError> {
        self.invoices
            .iter_mut()
            .find(|invoice| invoice.school_id == school_id && invoice.invoice_id == invoice_id)
            .ok_or_else(|| invoice_not_found(invoice_id))
    }

    fn payment_index_by_checkout(&self, checkout_request_id: &str) -> Result<usize, AppError> {
        self.payments
            .iter()
            .position(|payment| payment.checkout_request_id.as_deref() == Some(checkout_request_id))
            .ok_or_else(|| checkout_not_found(checkout_request_id))
    }
}

/// Thread-safe in-process store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_item(invoice_id: Uuid, item: &NewInvoiceItem, sort_order: i32) -> InvoiceItem {
    InvoiceItem {
        item_id: Uuid::new_v4(),
        invoice_id,
        description: item.description.clone(),
        amount: item.amount,
        category: item.category,
        fee_structure_id: item.fee_structure_id,
        is_dismissed: false,
        sort_order,
        created_utc: Utc::now(),
    }
}

fn next_sort_order(items: &[InvoiceItem]) -> i32 {
    items.iter().map(|item| item.sort_order).max().map_or(0, |max| max + 1)
}

fn without_items(invoice: &Invoice) -> Invoice {
    Invoice {
        items: Vec::new(),
        ..invoice.clone()
    }
}

fn negative_total(invoice_id: Uuid, total: Decimal) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(
        "Invoice {} total would become negative ({})",
        invoice_id,
        total
    ))
}

#[async_trait]
impl FeeStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Schools
    // -------------------------------------------------------------------------

    async fn create_school(&self, input: &CreateSchool) -> Result<School, AppError> {
        let mut tables = self.tables.lock().await;
        if tables.schools.iter().any(|record| record.school.code == input.code) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "School code '{}' is already in use",
                input.code
            )));
        }
        let school = School {
            school_id: Uuid::new_v4(),
            name: input.name.clone(),
            code: input.code.clone(),
            active: true,
            created_utc: Utc::now(),
        };
        tables.schools.push(SchoolRecord {
            school: school.clone(),
            invoice_sequence: 0,
        });
        Ok(school)
    }

    async fn get_school(&self, school_id: Uuid) -> Result<Option<School>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .schools
            .iter()
            .find(|record| record.school.school_id == school_id)
            .map(|record| record.school.clone()))
    }

    async fn list_school_summaries(&self) -> Result<Vec<SchoolSummary>, AppError> {
        let tables = self.tables.lock().await;
        let mut summaries: Vec<SchoolSummary> = tables
            .schools
            .iter()
            .map(|record| {
                let school_id = record.school.school_id;
                let billed = tables
                    .invoices
                    .iter()
                    .filter(|i| i.school_id == school_id && i.status != InvoiceStatus::Cancelled);
                SchoolSummary {
                    school_id,
                    name: record.school.name.clone(),
                    code: record.school.code.clone(),
                    student_count: tables
                        .students
                        .iter()
                        .filter(|s| s.school_id == school_id)
                        .count() as i64,
                    invoiced_total: billed.clone().map(|i| i.total_amount).sum(),
                    collected_total: tables
                        .payments
                        .iter()
                        .filter(|p| p.school_id == school_id && p.status == PaymentStatus::Completed)
                        .map(|p| p.amount)
                        .sum(),
                    outstanding_total: billed.map(|i| i.balance).sum(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    // -------------------------------------------------------------------------
    // Academic periods and classes
    // -------------------------------------------------------------------------

    async fn create_period(&self, input: &CreateAcademicPeriod) -> Result<AcademicPeriod, AppError> {
        let mut tables = self.tables.lock().await;
        if tables.periods.iter().any(|p| {
            p.school_id == input.school_id
                && p.term == input.term
                && p.academic_year == input.academic_year
        }) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Period {} {} already exists",
                input.term,
                input.academic_year
            )));
        }
        let period = AcademicPeriod {
            period_id: Uuid::new_v4(),
            school_id: input.school_id,
            term: input.term.clone(),
            academic_year: input.academic_year,
            is_active: false,
            created_utc: Utc::now(),
        };
        tables.periods.push(period.clone());
        Ok(period)
    }

    async fn get_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .periods
            .iter()
            .find(|p| p.school_id == school_id && p.period_id == period_id)
            .cloned())
    }

    async fn list_periods(&self, school_id: Uuid) -> Result<Vec<AcademicPeriod>, AppError> {
        let tables = self.tables.lock().await;
        let mut periods: Vec<AcademicPeriod> = tables
            .periods
            .iter()
            .filter(|p| p.school_id == school_id)
            .cloned()
            .collect();
        periods.sort_by(|a, b| {
            b.academic_year
                .cmp(&a.academic_year)
                .then_with(|| a.term.cmp(&b.term))
        });
        Ok(periods)
    }

    async fn activate_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError> {
        let mut tables = self.tables.lock().await;
        if !tables
            .periods
            .iter()
            .any(|p| p.school_id == school_id && p.period_id == period_id)
        {
            return Ok(None);
        }
        let mut activated = None;
        for period in tables.periods.iter_mut().filter(|p| p.school_id == school_id) {
            period.is_active = period.period_id == period_id;
            if period.is_active {
                activated = Some(period.clone());
            }
        }
        Ok(activated)
    }

    async fn create_class(&self, input: &CreateSchoolClass) -> Result<SchoolClass, AppError> {
        let mut tables = self.tables.lock().await;
        if tables
            .classes
            .iter()
            .any(|c| c.school_id == input.school_id && c.name == input.name)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Class '{}' already exists",
                input.name
            )));
        }
        let class = SchoolClass {
            class_id: Uuid::new_v4(),
            school_id: input.school_id,
            name: input.name.clone(),
            created_utc: Utc::now(),
        };
        tables.classes.push(class.clone());
        Ok(class)
    }

    async fn get_class(
        &self,
        school_id: Uuid,
        class_id: Uuid,
    ) -> Result<Option<SchoolClass>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .classes
            .iter()
            .find(|c| c.school_id == school_id && c.class_id == class_id)
            .cloned())
    }

    async fn list_classes(&self, school_id: Uuid) -> Result<Vec<SchoolClass>, AppError> {
        let tables = self.tables.lock().await;
        let mut classes: Vec<SchoolClass> = tables
            .classes
            .iter()
            .filter(|c| c.school_id == school_id)
            .cloned()
            .collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(classes)
    }

    // -------------------------------------------------------------------------
    // Students
    // -------------------------------------------------------------------------

    async fn create_student(&self, input: &CreateStudent) -> Result<Student, AppError> {
        let mut tables = self.tables.lock().await;
        if tables
            .students
            .iter()
            .any(|s| s.school_id == input.school_id && s.admission_number == input.admission_number)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Admission number '{}' is already in use",
                input.admission_number
            )));
        }
        let student = Student {
            student_id: Uuid::new_v4(),
            school_id: input.school_id,
            class_id: input.class_id,
            admission_number: input.admission_number.clone(),
            first_name: input.first_name.clone(),
            last_name: input.last_name.clone(),
            parent_user_id: input.parent_user_id.clone(),
            active: true,
            created_utc: Utc::now(),
        };
        tables.students.push(student.clone());
        Ok(student)
    }

    async fn get_student(
        &self,
        school_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<Student>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .students
            .iter()
            .find(|s| s.school_id == school_id && s.student_id == student_id)
            .cloned())
    }

    async fn list_students(
        &self,
        school_id: Uuid,
        filter: &ListStudentsFilter,
    ) -> Result<Vec<Student>, AppError> {
        let tables = self.tables.lock().await;
        let mut students: Vec<Student> = tables
            .students
            .iter()
            .filter(|s| s.school_id == school_id)
            .filter(|s| filter.class_id.map_or(true, |class_id| s.class_id == class_id))
            .filter(|s| filter.active.map_or(true, |active| s.active == active))
            .filter(|s| {
                filter
                    .parent_user_id
                    .as_ref()
                    .map_or(true, |parent| s.parent_user_id.as_ref() == Some(parent))
            })
            .cloned()
            .collect();
        students.sort_by(|a, b| a.admission_number.cmp(&b.admission_number));
        Ok(students)
    }

    async fn set_student_active(
        &self,
        school_id: Uuid,
        student_id: Uuid,
        active: bool,
    ) -> Result<Option<Student>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .students
            .iter_mut()
            .find(|s| s.school_id == school_id && s.student_id == student_id)
            .map(|student| {
                student.active = active;
                student.clone()
            }))
    }

    // -------------------------------------------------------------------------
    // Fee structures
    // -------------------------------------------------------------------------

    async fn create_fee_structure(
        &self,
        input: &CreateFeeStructure,
    ) -> Result<FeeStructure, AppError> {
        let mut tables = self.tables.lock().await;
        let fee = FeeStructure {
            fee_structure_id: Uuid::new_v4(),
            school_id: input.school_id,
            academic_period_id: input.academic_period_id,
            class_id: input.class_id,
            name: input.name.clone(),
            amount: input.amount,
            category: input.category,
            created_utc: Utc::now(),
        };
        tables.fee_structures.push(fee.clone());
        Ok(fee)
    }

    async fn list_fee_structures(
        &self,
        school_id: Uuid,
        academic_period_id: Option<Uuid>,
    ) -> Result<Vec<FeeStructure>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .fee_structures
            .iter()
            .filter(|f| f.school_id == school_id)
            .filter(|f| academic_period_id.map_or(true, |period| f.academic_period_id == period))
            .cloned()
            .collect())
    }

    async fn get_fee_structures(
        &self,
        school_id: Uuid,
        fee_structure_ids: &[Uuid],
    ) -> Result<Vec<FeeStructure>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .fee_structures
            .iter()
            .filter(|f| f.school_id == school_id && fee_structure_ids.contains(&f.fee_structure_id))
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    async fn create_invoice(&self, input: &NewInvoice, today: NaiveDate) -> Result<Invoice, AppError> {
        let mut tables = self.tables.lock().await;

        if tables.invoices.iter().any(|i| {
            i.student_id == input.student_id && i.academic_period_id == input.academic_period_id
        }) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Student {} already has an invoice for period {}",
                input.student_id,
                input.academic_period_id
            )));
        }

        let record = tables
            .schools
            .iter_mut()
            .find(|record| record.school.school_id == input.school_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("School {} not found", input.school_id)))?;
        record.invoice_sequence += 1;
        let sequence = record.invoice_sequence;

        let invoice_id = Uuid::new_v4();
        let total = input.total();
        let invoice = Invoice {
            invoice_id,
            school_id: input.school_id,
            student_id: input.student_id,
            academic_period_id: input.academic_period_id,
            invoice_number: format_invoice_number(today.year(), sequence),
            total_amount: total,
            paid_amount: Decimal::ZERO,
            balance: total,
            status: derive_status(InvoiceStatus::Pending, total, Decimal::ZERO, input.due_date, today),
            due_date: input.due_date,
            created_by: input.created_by.clone(),
            created_utc: Utc::now(),
            cancelled_utc: None,
            items: input
                .items
                .iter()
                .enumerate()
                .map(|(index, item)| new_item(invoice_id, item, index as i32))
                .collect(),
        };
        tables.invoices.push(invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .invoices
            .iter()
            .find(|i| i.school_id == school_id && i.invoice_id == invoice_id)
            .cloned())
    }

    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let tables = self.tables.lock().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .iter()
            .filter(|i| i.school_id == school_id)
            .filter(|i| filter.status.map_or(true, |status| i.status == status))
            .filter(|i| filter.student_id.map_or(true, |student| i.student_id == student))
            .filter(|i| {
                filter
                    .academic_period_id
                    .map_or(true, |period| i.academic_period_id == period)
            })
            .map(without_items)
            .collect();
        invoices.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then_with(|| a.invoice_id.cmp(&b.invoice_id))
        });
        Ok(invoices)
    }

    async fn add_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item: &NewInvoiceItem,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let mut tables = self.tables.lock().await;
        let invoice = tables.invoice_mut(school_id, invoice_id)?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(invoice_cancelled(invoice_id));
        }

        let mut updated = invoice.clone();
        let sort_order = next_sort_order(&updated.items);
        updated.items.push(new_item(invoice_id, item, sort_order));
        updated.recompute(today);
        if updated.total_amount < Decimal::ZERO {
            return Err(negative_total(invoice_id, updated.total_amount));
        }

        *invoice = updated.clone();
        Ok(updated)
    }

    async fn dismiss_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item_id: Uuid,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let mut tables = self.tables.lock().await;
        let invoice = tables.invoice_mut(school_id, invoice_id)?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(invoice_cancelled(invoice_id));
        }

        let mut updated = invoice.clone();
        let item = updated
            .items
            .iter_mut()
            .find(|item| item.item_id == item_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Item {} not found on invoice {}",
                    item_id,
                    invoice_id
                ))
            })?;
        if item.is_dismissed {
            return Ok(updated);
        }
        item.is_dismissed = true;

        updated.recompute(today);
        if updated.total_amount < Decimal::ZERO {
            return Err(negative_total(invoice_id, updated.total_amount));
        }

        *invoice = updated.clone();
        Ok(updated)
    }

    async fn mark_overdue(&self, school_id: Uuid, as_of: NaiveDate) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let mut moved = 0;
        for invoice in tables.invoices.iter_mut().filter(|i| {
            i.school_id == school_id
                && matches!(i.status, InvoiceStatus::Pending | InvoiceStatus::PartiallyPaid)
                && i.due_date < as_of
        }) {
            invoice.status = InvoiceStatus::Overdue;
            moved += 1;
        }
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    async fn record_payment(&self, input: &NewPayment, today: NaiveDate) -> Result<Payment, AppError> {
        let mut tables = self.tables.lock().await;

        if let Some(checkout) = &input.checkout_request_id {
            if tables
                .payments
                .iter()
                .any(|p| p.checkout_request_id.as_ref() == Some(checkout))
            {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Duplicate checkout request id"
                )));
            }
        }

        if let Some(invoice_id) = input.invoice_id {
            let invoice = tables.invoice_mut(input.school_id, invoice_id)?;
            if invoice.student_id != input.student_id {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invoice {} does not belong to student {}",
                    invoice_id,
                    input.student_id
                )));
            }
            if invoice.status == InvoiceStatus::Cancelled {
                return Err(invoice_cancelled(invoice_id));
            }
            if input.status == PaymentStatus::Completed {
                invoice.apply_payment(input.amount, today);
            }
        }

        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            school_id: input.school_id,
            student_id: input.student_id,
            invoice_id: input.invoice_id,
            amount: input.amount,
            method: input.method,
            status: input.status,
            reference: input.reference.clone(),
            phone_number: input.phone_number.clone(),
            checkout_request_id: input.checkout_request_id.clone(),
            gateway_transaction_id: None,
            recorded_by: input.recorded_by.clone(),
            created_utc: now,
            completed_utc: (input.status == PaymentStatus::Completed).then_some(now),
        };
        tables.payments.push(payment.clone());
        Ok(payment)
    }

    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError> {
        let tables = self.tables.lock().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .iter()
            .filter(|p| p.school_id == school_id)
            .filter(|p| filter.student_id.map_or(true, |student| p.student_id == student))
            .filter(|p| filter.invoice_id.map_or(true, |invoice| p.invoice_id == Some(invoice)))
            .filter(|p| filter.status.map_or(true, |status| p.status == status))
            .cloned()
            .collect();
        payments.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then_with(|| a.payment_id.cmp(&b.payment_id))
        });
        Ok(payments)
    }

    async fn get_payment_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn complete_mobile_payment(
        &self,
        checkout_request_id: &str,
        gateway_transaction_id: &str,
        completed_at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<(Payment, CallbackOutcome), AppError> {
        let mut tables = self.tables.lock().await;
        let index = tables.payment_index_by_checkout(checkout_request_id)?;

        match tables.payments[index].status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed => {
                return Ok((tables.payments[index].clone(), CallbackOutcome::Duplicate));
            }
            other => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Payment for checkout {} is {}",
                    checkout_request_id,
                    other.as_str()
                )));
            }
        }

        if tables
            .payments
            .iter()
            .any(|p| p.gateway_transaction_id.as_deref() == Some(gateway_transaction_id))
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Gateway transaction {} was already reconciled",
                gateway_transaction_id
            )));
        }

        let payment = {
            let payment = &mut tables.payments[index];
            payment.status = PaymentStatus::Completed;
            payment.gateway_transaction_id = Some(gateway_transaction_id.to_string());
            payment.completed_utc = Some(completed_at);
            payment.clone()
        };

        if let Some(invoice_id) = payment.invoice_id {
            let invoice = tables.invoice_mut(payment.school_id, invoice_id)?;
            if invoice.status != InvoiceStatus::Cancelled {
                invoice.apply_payment(payment.amount, today);
            } else {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    payment_id = %payment.payment_id,
                    "Mobile payment completed against a cancelled invoice; left unapplied"
                );
            }
        }

        Ok((payment, CallbackOutcome::Applied))
    }

    async fn fail_mobile_payment(
        &self,
        checkout_request_id: &str,
    ) -> Result<(Payment, CallbackOutcome), AppError> {
        let mut tables = self.tables.lock().await;
        let index = tables.payment_index_by_checkout(checkout_request_id)?;
        let payment = &mut tables.payments[index];
        if payment.status != PaymentStatus::Pending {
            return Ok((payment.clone(), CallbackOutcome::Duplicate));
        }
        payment.status = PaymentStatus::Failed;
        Ok((payment.clone(), CallbackOutcome::Failed))
    }

    // -------------------------------------------------------------------------
    // Approval requests
    // -------------------------------------------------------------------------

    async fn create_approval(
        &self,
        input: &NewApprovalRequest,
    ) -> Result<ApprovalRequest, AppError> {
        let mut tables = self.tables.lock().await;
        let request_type = input.payload.request_type();
        let invoice_id = input.payload.invoice_id();

        if tables.approvals.iter().any(|r| {
            r.invoice_id == invoice_id
                && r.request_type == request_type
                && r.status == ApprovalStatus::Pending
        }) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A pending {} request already exists for invoice {}",
                request_type.as_str(),
                invoice_id
            )));
        }

        let request = ApprovalRequest {
            request_id: Uuid::new_v4(),
            school_id: input.school_id,
            request_type,
            invoice_id,
            payload: Json(input.payload.clone()),
            reason: input.reason.clone(),
            status: ApprovalStatus::Pending,
            requested_by: input.requested_by.clone(),
            approved_by: None,
            resolution_note: None,
            created_utc: Utc::now(),
            resolved_utc: None,
        };
        tables.approvals.push(request.clone());
        Ok(request)
    }

    async fn get_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .approvals
            .iter()
            .find(|r| r.school_id == school_id && r.request_id == request_id)
            .cloned())
    }

    async fn list_approvals(
        &self,
        school_id: Uuid,
        filter: &ListApprovalsFilter,
    ) -> Result<Vec<ApprovalRequest>, AppError> {
        let tables = self.tables.lock().await;
        let mut requests: Vec<ApprovalRequest> = tables
            .approvals
            .iter()
            .filter(|r| r.school_id == school_id)
            .filter(|r| filter.status.map_or(true, |status| r.status == status))
            .filter(|r| filter.invoice_id.map_or(true, |invoice| r.invoice_id == invoice))
            .cloned()
            .collect();
        requests.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(requests)
    }

    async fn resolve_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
        decision: &ApprovalDecision,
        today: NaiveDate,
    ) -> Result<ApprovalRequest, AppError> {
        let mut tables = self.tables.lock().await;

        let index = tables
            .approvals
            .iter()
            .position(|r| r.school_id == school_id && r.request_id == request_id)
            .ok_or_else(|| approval_not_found(request_id))?;
        if tables.approvals[index].status != ApprovalStatus::Pending {
            return Err(approval_already_resolved(request_id));
        }

        if decision.status == ApprovalStatus::Approved {
            let request = tables.approvals[index].clone();
            let invoice = tables.invoice_mut(school_id, request.invoice_id)?;
            if invoice.status == InvoiceStatus::Cancelled {
                return Err(invoice_cancelled(invoice.invoice_id));
            }

            match &request.payload.0 {
                ApprovalPayload::InvoiceCancellation { .. } => {
                    invoice.cancel(decision.at);
                }
                ApprovalPayload::BalanceAdjustment(proposal) => {
                    if invoice.total_amount != proposal.previous_total
                        || invoice.paid_amount != proposal.previous_paid
                    {
                        return Err(proposal_outdated(invoice.invoice_id));
                    }
                    let item = NewInvoiceItem {
                        description: proposal.description.clone(),
                        amount: proposal.amount,
                        category: FeeCategory::Adjustment,
                        fee_structure_id: None,
                    };
                    let sort_order = next_sort_order(&invoice.items);
                    invoice.items.push(new_item(invoice.invoice_id, &item, sort_order));
                    invoice.total_amount = proposal.new_total;
                    invoice.balance = proposal.new_balance;
                    invoice.status = derive_status(
                        invoice.status,
                        invoice.total_amount,
                        invoice.paid_amount,
                        invoice.due_date,
                        today,
                    );
                }
            }
        }

        let request = &mut tables.approvals[index];
        request.status = decision.status;
        request.approved_by = Some(decision.resolved_by.clone());
        request.resolution_note = decision.note.clone();
        request.resolved_utc = Some(decision.at);
        Ok(request.clone())
    }

    // -------------------------------------------------------------------------
    // Impersonation sessions
    // -------------------------------------------------------------------------

    async fn create_impersonation(
        &self,
        input: &NewImpersonationSession,
    ) -> Result<ImpersonationSession, AppError> {
        let mut tables = self.tables.lock().await;
        let session = ImpersonationSession {
            session_id: Uuid::new_v4(),
            token: input.token.clone(),
            actor_id: input.actor_id.clone(),
            target_user_id: input.target_user_id.clone(),
            target_school_id: input.target_school_id,
            target_role: input.target_role,
            reason: input.reason.clone(),
            issued_utc: input.issued_utc,
            expires_utc: input.expires_utc,
            revoked_utc: None,
        };
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_impersonation(
        &self,
        token: &str,
    ) -> Result<Option<ImpersonationSession>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables.sessions.iter().find(|s| s.token == token).cloned())
    }

    async fn revoke_impersonation(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ImpersonationSession>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .iter_mut()
            .find(|s| s.token == token)
            .map(|session| {
                session.revoked_utc.get_or_insert(at);
                session.clone()
            }))
    }

    async fn list_impersonations(&self) -> Result<Vec<ImpersonationSession>, AppError> {
        let tables = self.tables.lock().await;
        let mut sessions = tables.sessions.clone();
        sessions.sort_by(|a, b| b.issued_utc.cmp(&a.issued_utc));
        Ok(sessions)
    }
}
