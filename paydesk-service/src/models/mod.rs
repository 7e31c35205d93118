//! Domain models for paydesk-service.

mod academic;
mod approval;
mod impersonation;
mod invoice;
mod ledger;
mod payment;
mod school;

pub use academic::{
    AcademicPeriod, CreateAcademicPeriod, CreateFeeStructure, CreateSchoolClass, CreateStudent,
    FeeCategory, FeeStructure, ListStudentsFilter, SchoolClass, Student,
};
pub use approval::{
    AdjustmentProposal, ApprovalDecision, ApprovalPayload, ApprovalRequest, ApprovalStatus,
    ApprovalType, ListApprovalsFilter, NewApprovalRequest,
};
pub use impersonation::{ImpersonationSession, NewImpersonationSession};
pub use invoice::{
    derive_status, format_invoice_number, sum_active_items, Invoice, InvoiceItem, InvoiceStatus,
    ListInvoicesFilter, NewInvoice, NewInvoiceItem,
};
pub use ledger::{build_ledger, LedgerEntry, LedgerEntryType, StudentLedger};
pub use payment::{
    CallbackOutcome, ListPaymentsFilter, NewPayment, Payment, PaymentMethod, PaymentStatus,
};
pub use school::{CreateSchool, School, SchoolSummary};
