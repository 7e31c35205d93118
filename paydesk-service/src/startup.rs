//! Application startup and lifecycle management.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{PaydeskConfig, StorageBackend};
use crate::handlers::{academics, admin, approvals, exports, health, invoices, payments};
use crate::services::{
    init_metrics, ApprovalService, Database, FeeStore, HttpStkGateway, ImpersonationService,
    LogNotifier, MemoryStore, MobileMoneyGateway, Notifier, SandboxGateway,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FeeStore>,
    pub gateway: Arc<dyn MobileMoneyGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub approvals: ApprovalService,
    pub impersonation: ImpersonationService,
    /// HMAC secret for gateway callbacks; unsigned callbacks are accepted when unset.
    pub callback_secret: Option<Secret<String>>,
}

impl AppState {
    /// State over the given store with the sandbox gateway and log notifier.
    pub fn with_store(store: Arc<dyn FeeStore>, config: &PaydeskConfig) -> Self {
        Self {
            store,
            gateway: Arc::new(SandboxGateway::new()),
            notifier: Arc::new(LogNotifier::new()),
            approvals: ApprovalService::new(config.approval_threshold),
            impersonation: ImpersonationService::new(config.impersonation_max_minutes),
            callback_secret: config.gateway.callback_secret.clone(),
        }
    }

    pub fn callback_secret(&self) -> Option<&str> {
        self.callback_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
    }
}

/// Full HTTP router for the service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        // Platform administration
        .route(
            "/admin/schools",
            post(admin::create_school).get(admin::list_schools),
        )
        .route(
            "/admin/impersonations",
            post(admin::start_impersonation).get(admin::list_impersonations),
        )
        .route(
            "/admin/impersonations/:token",
            delete(admin::end_impersonation),
        )
        // Academics
        .route(
            "/periods",
            post(academics::create_period).get(academics::list_periods),
        )
        .route("/periods/:id/activate", post(academics::activate_period))
        .route(
            "/classes",
            post(academics::create_class).get(academics::list_classes),
        )
        .route(
            "/students",
            post(academics::create_student).get(academics::list_students),
        )
        .route("/students/:id", get(academics::get_student))
        .route(
            "/students/:id/status",
            axum::routing::patch(academics::set_student_status),
        )
        .route("/students/:id/ledger", get(academics::student_ledger))
        .route(
            "/fee-structures",
            post(academics::create_fee_structure).get(academics::list_fee_structures),
        )
        // Invoices
        .route(
            "/invoices",
            post(invoices::create_invoice).get(invoices::list_invoices),
        )
        .route("/invoices/bulk", post(invoices::bulk_generate))
        .route("/invoices/overdue-sweep", post(invoices::overdue_sweep))
        .route("/invoices/:id", get(invoices::get_invoice))
        .route("/invoices/:id/items", post(invoices::add_item))
        .route(
            "/invoices/:id/items/:item_id/dismiss",
            post(invoices::dismiss_item),
        )
        .route("/invoices/:id/cancel", post(invoices::request_cancellation))
        .route("/invoices/:id/adjust", post(invoices::adjust_balance))
        // Approvals
        .route("/approvals", get(approvals::list_approvals))
        .route("/approvals/:id", get(approvals::get_approval))
        .route("/approvals/:id/approve", post(approvals::approve))
        .route("/approvals/:id/reject", post(approvals::reject))
        // Payments
        .route(
            "/payments",
            post(payments::record_payment).get(payments::list_payments),
        )
        .route("/payments/mpesa/stk-push", post(payments::stk_push))
        .route("/payments/mpesa/callback", post(payments::mpesa_callback))
        // Exports
        .route("/exports/invoices.csv", get(exports::invoices_csv))
        .route("/exports/payments.csv", get(exports::payments_csv))
        .route("/exports/students.csv", get(exports::students_csv))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: PaydeskConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn FeeStore> = match &config.storage {
            StorageBackend::Postgres(database) => {
                let db = Database::new(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(db)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        let mut state = AppState::with_store(store, &config);

        match &config.gateway.base_url {
            Some(base_url) => {
                let gateway = HttpStkGateway::new(base_url.clone(), config.gateway.shortcode.clone())
                    .map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "Failed to create mobile-money gateway client: {}",
                            e
                        ))
                    })?;
                tracing::info!(endpoint = %base_url, "Mobile-money gateway configured");
                state.gateway = Arc::new(gateway);
            }
            None => {
                tracing::info!("Mobile-money gateway URL not configured - using sandbox gateway");
            }
        }

        if state.callback_secret.is_none() {
            tracing::warn!("MPESA_CALLBACK_SECRET not set - gateway callbacks are not verified");
        }

        let addr = config.common.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "PayDesk listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "paydesk-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
