//! Dual-authorization workflow for invoice cancellation and large balance
//! adjustments.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::authz::Principal;
use crate::models::{
    AdjustmentProposal, ApprovalDecision, ApprovalPayload, ApprovalRequest, ApprovalStatus,
    FeeCategory, Invoice, InvoiceStatus, NewApprovalRequest, NewInvoiceItem,
};
use crate::services::metrics::APPROVALS_TOTAL;
use crate::services::notifier::{notify_best_effort, Notification, Notifier};
use crate::services::store::{invoice_not_found, FeeStore};

/// Default absolute amount above which an adjustment needs a second approver.
pub const DEFAULT_APPROVAL_THRESHOLD: i64 = 10_000;

/// Result of an adjustment request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdjustmentOutcome {
    /// Small enough to apply immediately.
    Applied { invoice: Invoice },
    /// Parked for a second administrator.
    PendingApproval { request: ApprovalRequest },
}

#[derive(Debug, Clone)]
pub struct ApprovalService {
    threshold: Decimal,
}

impl Default for ApprovalService {
    fn default() -> Self {
        Self::new(Decimal::from(DEFAULT_APPROVAL_THRESHOLD))
    }
}

fn require_reason(reason: &str) -> Result<String, AppError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("A reason is required")));
    }
    Ok(reason.to_string())
}

async fn load_invoice(
    store: &dyn FeeStore,
    school_id: Uuid,
    invoice_id: Uuid,
) -> Result<Invoice, AppError> {
    store
        .get_invoice(school_id, invoice_id)
        .await?
        .ok_or_else(|| invoice_not_found(invoice_id))
}

impl ApprovalService {
    pub fn new(threshold: Decimal) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Adjustments strictly larger in magnitude than the threshold need approval.
    pub fn requires_approval(&self, amount: Decimal) -> bool {
        amount.abs() > self.threshold
    }

    #[instrument(skip(self, store, principal, reason), fields(user_id = %principal.user_id))]
    pub async fn request_cancellation(
        &self,
        store: &dyn FeeStore,
        principal: &Principal,
        invoice_id: Uuid,
        reason: &str,
    ) -> Result<ApprovalRequest, AppError> {
        let school_id = principal.school_id()?;
        let reason = require_reason(reason)?;
        let invoice = load_invoice(store, school_id, invoice_id).await?;

        match invoice.status {
            InvoiceStatus::Cancelled => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} is already cancelled",
                    invoice.invoice_number
                )));
            }
            InvoiceStatus::Paid => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Invoice {} is fully paid and cannot be cancelled",
                    invoice.invoice_number
                )));
            }
            _ => {}
        }

        let request = store
            .create_approval(&NewApprovalRequest {
                school_id,
                payload: ApprovalPayload::InvoiceCancellation { invoice_id },
                reason,
                requested_by: principal.user_id.clone(),
            })
            .await?;

        APPROVALS_TOTAL
            .with_label_values(&[request.request_type.as_str(), "PENDING"])
            .inc();
        info!(request_id = %request.request_id, invoice_id = %invoice_id, "Cancellation requested");

        Ok(request)
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, store, principal, description, reason), fields(user_id = %principal.user_id, amount = %amount))]
    pub async fn adjust_balance(
        &self,
        store: &dyn FeeStore,
        principal: &Principal,
        invoice_id: Uuid,
        amount: Decimal,
        description: &str,
        reason: &str,
        today: NaiveDate,
    ) -> Result<AdjustmentOutcome, AppError> {
        let school_id = principal.school_id()?;
        let reason = require_reason(reason)?;
        if amount.is_zero() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Adjustment amount must be non-zero"
            )));
        }
        let description = match description.trim() {
            "" => format!("Balance adjustment: {}", reason),
            text => text.to_string(),
        };

        let invoice = load_invoice(store, school_id, invoice_id).await?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is cancelled",
                invoice.invoice_number
            )));
        }
        if invoice.total_amount + amount < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Adjustment would make the invoice total negative"
            )));
        }

        if !self.requires_approval(amount) {
            let item = NewInvoiceItem {
                description,
                amount,
                category: FeeCategory::Adjustment,
                fee_structure_id: None,
            };
            let invoice = store
                .add_invoice_item(school_id, invoice_id, &item, today)
                .await?;
            info!(invoice_id = %invoice_id, "Adjustment applied directly");
            return Ok(AdjustmentOutcome::Applied { invoice });
        }

        let proposal = AdjustmentProposal::new(
            invoice_id,
            amount,
            description,
            invoice.total_amount,
            invoice.paid_amount,
        );
        let request = store
            .create_approval(&NewApprovalRequest {
                school_id,
                payload: ApprovalPayload::BalanceAdjustment(proposal),
                reason,
                requested_by: principal.user_id.clone(),
            })
            .await?;

        APPROVALS_TOTAL
            .with_label_values(&[request.request_type.as_str(), "PENDING"])
            .inc();
        info!(request_id = %request.request_id, invoice_id = %invoice_id, "Adjustment parked for approval");

        Ok(AdjustmentOutcome::PendingApproval { request })
    }

    /// Add a line to an invoice. Adjustment lines and lines above the
    /// threshold only enter through [`ApprovalService::adjust_balance`].
    #[instrument(skip(self, store, principal, item), fields(user_id = %principal.user_id, amount = %item.amount))]
    pub async fn add_item(
        &self,
        store: &dyn FeeStore,
        principal: &Principal,
        invoice_id: Uuid,
        item: &NewInvoiceItem,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        if item.category == FeeCategory::Adjustment {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Adjustments must be raised through /invoices/{}/adjust",
                invoice_id
            )));
        }
        if self.requires_approval(item.amount) {
            return Err(self.needs_adjustment(invoice_id, item.amount));
        }

        store
            .add_invoice_item(principal.school_id()?, invoice_id, item, today)
            .await
    }

    /// Dismiss a line. Removing more than the threshold from the total needs
    /// an approved adjustment instead.
    #[instrument(skip(self, store, principal), fields(user_id = %principal.user_id))]
    pub async fn dismiss_item(
        &self,
        store: &dyn FeeStore,
        principal: &Principal,
        invoice_id: Uuid,
        item_id: Uuid,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let school_id = principal.school_id()?;
        let invoice = load_invoice(store, school_id, invoice_id).await?;
        let item = invoice
            .items
            .iter()
            .find(|item| item.item_id == item_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Item {} not found on invoice {}",
                    item_id,
                    invoice_id
                ))
            })?;
        if !item.is_dismissed && self.requires_approval(item.amount) {
            return Err(self.needs_adjustment(invoice_id, -item.amount));
        }

        store
            .dismiss_invoice_item(school_id, invoice_id, item_id, today)
            .await
    }

    fn needs_adjustment(&self, invoice_id: Uuid, amount: Decimal) -> AppError {
        AppError::BadRequest(anyhow::anyhow!(
            "A change of {} exceeds the approval threshold of {}; raise it through /invoices/{}/adjust",
            amount,
            self.threshold,
            invoice_id
        ))
    }

    /// Approve a pending request and apply its mutation.
    #[instrument(skip(self, store, notifier, principal, note), fields(user_id = %principal.user_id))]
    pub async fn approve(
        &self,
        store: &dyn FeeStore,
        notifier: &dyn Notifier,
        principal: &Principal,
        request_id: Uuid,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, AppError> {
        self.resolve(store, notifier, principal, request_id, ApprovalStatus::Approved, note, now)
            .await
    }

    /// Reject a pending request. The requester may withdraw their own request this way.
    #[instrument(skip(self, store, notifier, principal, note), fields(user_id = %principal.user_id))]
    pub async fn reject(
        &self,
        store: &dyn FeeStore,
        notifier: &dyn Notifier,
        principal: &Principal,
        request_id: Uuid,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, AppError> {
        self.resolve(store, notifier, principal, request_id, ApprovalStatus::Rejected, note, now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        store: &dyn FeeStore,
        notifier: &dyn Notifier,
        principal: &Principal,
        request_id: Uuid,
        status: ApprovalStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, AppError> {
        if let Some(actor) = &principal.impersonated_by {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Approval requests cannot be resolved during impersonation by {}",
                actor
            )));
        }
        let school_id = principal.school_id()?;
        let request = store
            .get_approval(school_id, request_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Approval request {} not found", request_id))
            })?;

        if request.status != ApprovalStatus::Pending {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Approval request {} is already {}",
                request_id,
                request.status.as_str()
            )));
        }
        if status == ApprovalStatus::Approved && request.requested_by == principal.user_id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Requests must be approved by a different administrator"
            )));
        }

        let decision = ApprovalDecision {
            status,
            resolved_by: principal.user_id.clone(),
            note: note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            at: now,
        };
        let resolved = store
            .resolve_approval(school_id, request_id, &decision, now.date_naive())
            .await?;

        APPROVALS_TOTAL
            .with_label_values(&[resolved.request_type.as_str(), resolved.status.as_str()])
            .inc();
        info!(
            request_id = %request_id,
            status = resolved.status.as_str(),
            "Approval request resolved"
        );

        notify_best_effort(
            notifier,
            Notification::ApprovalResolved {
                school_id,
                request_id,
                status: resolved.status,
                requested_by: resolved.requested_by.clone(),
            },
        )
        .await;

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exclusive() {
        let service = ApprovalService::default();
        assert!(!service.requires_approval(Decimal::from(10_000)));
        assert!(!service.requires_approval(Decimal::from(-10_000)));
        assert!(service.requires_approval(Decimal::from(10_001)));
        assert!(service.requires_approval(Decimal::from(-15_000)));
        assert!(!service.requires_approval(Decimal::from(500)));
    }

    #[test]
    fn custom_threshold_is_respected() {
        let service = ApprovalService::new(Decimal::from(2_000));
        assert_eq!(service.threshold(), Decimal::from(2_000));
        assert!(service.requires_approval(Decimal::from(2_500)));
    }
}
