//! Storage abstraction for the fee service.
//!
//! Implementations must provide the storage-level guarantees the services
//! rely on:
//! - one invoice per (student, academic period), reported as `Conflict`;
//! - at most one active academic period per school;
//! - approval resolution only while the request is still PENDING, applied
//!   atomically with the guarded invoice mutation;
//! - a gateway transaction id is reconciled at most once.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    AcademicPeriod, ApprovalDecision, ApprovalRequest, CallbackOutcome, CreateAcademicPeriod,
    CreateFeeStructure, CreateSchool, CreateSchoolClass, CreateStudent, FeeStructure,
    ImpersonationSession, Invoice, ListApprovalsFilter, ListInvoicesFilter, ListPaymentsFilter,
    ListStudentsFilter, NewApprovalRequest, NewImpersonationSession, NewInvoice, NewInvoiceItem,
    NewPayment, Payment, School, SchoolClass, SchoolSummary, Student,
};

#[async_trait]
pub trait FeeStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // -------------------------------------------------------------------------
    // Schools
    // -------------------------------------------------------------------------

    async fn create_school(&self, input: &CreateSchool) -> Result<School, AppError>;

    async fn get_school(&self, school_id: Uuid) -> Result<Option<School>, AppError>;

    async fn list_school_summaries(&self) -> Result<Vec<SchoolSummary>, AppError>;

    // -------------------------------------------------------------------------
    // Academic periods and classes
    // -------------------------------------------------------------------------

    async fn create_period(&self, input: &CreateAcademicPeriod) -> Result<AcademicPeriod, AppError>;

    async fn get_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError>;

    async fn list_periods(&self, school_id: Uuid) -> Result<Vec<AcademicPeriod>, AppError>;

    /// Make `period_id` the school's only active period. `None` if unknown.
    async fn activate_period(
        &self,
        school_id: Uuid,
        period_id: Uuid,
    ) -> Result<Option<AcademicPeriod>, AppError>;

    async fn create_class(&self, input: &CreateSchoolClass) -> Result<SchoolClass, AppError>;

    async fn get_class(&self, school_id: Uuid, class_id: Uuid)
        -> Result<Option<SchoolClass>, AppError>;

    async fn list_classes(&self, school_id: Uuid) -> Result<Vec<SchoolClass>, AppError>;

    // -------------------------------------------------------------------------
    // Students
    // -------------------------------------------------------------------------

    async fn create_student(&self, input: &CreateStudent) -> Result<Student, AppError>;

    async fn get_student(&self, school_id: Uuid, student_id: Uuid)
        -> Result<Option<Student>, AppError>;

    async fn list_students(
        &self,
        school_id: Uuid,
        filter: &ListStudentsFilter,
    ) -> Result<Vec<Student>, AppError>;

    async fn set_student_active(
        &self,
        school_id: Uuid,
        student_id: Uuid,
        active: bool,
    ) -> Result<Option<Student>, AppError>;

    // -------------------------------------------------------------------------
    // Fee structures
    // -------------------------------------------------------------------------

    async fn create_fee_structure(
        &self,
        input: &CreateFeeStructure,
    ) -> Result<FeeStructure, AppError>;

    async fn list_fee_structures(
        &self,
        school_id: Uuid,
        academic_period_id: Option<Uuid>,
    ) -> Result<Vec<FeeStructure>, AppError>;

    /// Fetch the given fee structures that belong to the school; unknown ids are omitted.
    async fn get_fee_structures(
        &self,
        school_id: Uuid,
        fee_structure_ids: &[Uuid],
    ) -> Result<Vec<FeeStructure>, AppError>;

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    /// Insert an invoice and its items. `Conflict` if the student already has
    /// an invoice for the period.
    async fn create_invoice(&self, input: &NewInvoice, today: NaiveDate)
        -> Result<Invoice, AppError>;

    /// Invoice with its items.
    async fn get_invoice(&self, school_id: Uuid, invoice_id: Uuid)
        -> Result<Option<Invoice>, AppError>;

    /// Invoices without items, newest first.
    async fn list_invoices(
        &self,
        school_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError>;

    async fn add_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item: &NewInvoiceItem,
        today: NaiveDate,
    ) -> Result<Invoice, AppError>;

    async fn dismiss_invoice_item(
        &self,
        school_id: Uuid,
        invoice_id: Uuid,
        item_id: Uuid,
        today: NaiveDate,
    ) -> Result<Invoice, AppError>;

    /// Move open invoices due before `as_of` to OVERDUE. Returns how many moved.
    async fn mark_overdue(&self, school_id: Uuid, as_of: NaiveDate) -> Result<u64, AppError>;

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    /// Insert a payment; a COMPLETED payment against an invoice is applied to
    /// it in the same unit of work.
    async fn record_payment(&self, input: &NewPayment, today: NaiveDate)
        -> Result<Payment, AppError>;

    async fn list_payments(
        &self,
        school_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError>;

    async fn get_payment_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, AppError>;

    /// Complete a pending mobile payment and apply it to its invoice, exactly
    /// once per gateway transaction id.
    async fn complete_mobile_payment(
        &self,
        checkout_request_id: &str,
        gateway_transaction_id: &str,
        completed_at: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<(Payment, CallbackOutcome), AppError>;

    async fn fail_mobile_payment(
        &self,
        checkout_request_id: &str,
    ) -> Result<(Payment, CallbackOutcome), AppError>;

    // -------------------------------------------------------------------------
    // Approval requests
    // -------------------------------------------------------------------------

    /// `Conflict` if a PENDING request of the same type already targets the invoice.
    async fn create_approval(&self, input: &NewApprovalRequest)
        -> Result<ApprovalRequest, AppError>;

    async fn get_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, AppError>;

    async fn list_approvals(
        &self,
        school_id: Uuid,
        filter: &ListApprovalsFilter,
    ) -> Result<Vec<ApprovalRequest>, AppError>;

    /// Resolve a PENDING request. On approval the payload's invoice mutation is
    /// applied in the same unit of work. `Conflict` when the request is no longer
    /// PENDING or the invoice drifted from the proposal's snapshot.
    async fn resolve_approval(
        &self,
        school_id: Uuid,
        request_id: Uuid,
        decision: &ApprovalDecision,
        today: NaiveDate,
    ) -> Result<ApprovalRequest, AppError>;

    // -------------------------------------------------------------------------
    // Impersonation sessions
    // -------------------------------------------------------------------------

    async fn create_impersonation(
        &self,
        input: &NewImpersonationSession,
    ) -> Result<ImpersonationSession, AppError>;

    async fn get_impersonation(&self, token: &str)
        -> Result<Option<ImpersonationSession>, AppError>;

    async fn revoke_impersonation(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ImpersonationSession>, AppError>;

    async fn list_impersonations(&self) -> Result<Vec<ImpersonationSession>, AppError>;
}

pub(crate) fn invoice_not_found(invoice_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
}

pub(crate) fn invoice_cancelled(invoice_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!("Invoice {} is cancelled", invoice_id))
}

pub(crate) fn approval_not_found(request_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Approval request {} not found", request_id))
}

pub(crate) fn approval_already_resolved(request_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Approval request {} has already been resolved",
        request_id
    ))
}

pub(crate) fn proposal_outdated(invoice_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Invoice {} changed since the adjustment was requested; raise a new request",
        invoice_id
    ))
}

pub(crate) fn checkout_not_found(checkout_request_id: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!(
        "No payment for checkout request {}",
        checkout_request_id
    ))
}
