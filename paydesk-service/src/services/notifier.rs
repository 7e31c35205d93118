//! Outbound notifications (payment receipts, approval outcomes).
//!
//! Delivery is best-effort: [`notify_best_effort`] logs and counts failures
//! but never propagates them to the caller.

use crate::models::ApprovalStatus;
use crate::services::metrics::ERRORS_TOTAL;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Send error: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone)]
pub enum Notification {
    PaymentReceived {
        school_id: Uuid,
        student_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
    ApprovalResolved {
        school_id: Uuid,
        request_id: Uuid,
        status: ApprovalStatus,
        requested_by: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::PaymentReceived { .. } => "payment_received",
            Notification::ApprovalResolved { .. } => "approval_resolved",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Default)]
pub struct LogNotifier {
    sent: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::info!(kind = notification.kind(), ?notification, "[LOG] Notification would be sent");
        Ok(())
    }
}

/// Deliver a notification, swallowing failures.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        ERRORS_TOTAL.with_label_values(&["notification"]).inc();
        tracing::warn!(
            kind = notification.kind(),
            error = %e,
            "Notification delivery failed; continuing"
        );
    }
}
