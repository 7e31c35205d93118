//! Services module for paydesk-service.

pub mod approvals;
pub mod bulk;
pub mod database;
pub mod export;
pub mod gateway;
pub mod impersonation;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod payments;
pub mod store;

pub use approvals::{AdjustmentOutcome, ApprovalService};
pub use database::Database;
pub use gateway::{HttpStkGateway, MobileMoneyGateway, SandboxGateway};
pub use impersonation::ImpersonationService;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{LogNotifier, Notifier};
pub use store::FeeStore;
