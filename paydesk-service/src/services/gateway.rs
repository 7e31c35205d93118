//! Mobile-money (M-Pesa style) STK push gateway.
//!
//! The gateway only accepts or rejects a push; the outcome arrives later
//! through the callback endpoint.

use crate::services::metrics::GATEWAY_REQUEST_DURATION;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway rejected the request: {0}")]
    Rejected(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),
}

/// Push request sent to the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct StkPushRequest {
    pub student_id: Uuid,
    pub invoice_id: Uuid,
    pub phone_number: String,
    pub amount: Decimal,
    /// Shown on the payer's handset, typically the invoice number.
    pub account_reference: String,
}

/// Gateway acknowledgement of a push.
#[derive(Debug, Clone, Deserialize)]
pub struct StkPushAccepted {
    pub checkout_request_id: String,
    #[serde(default)]
    pub customer_message: Option<String>,
}

#[async_trait]
pub trait MobileMoneyGateway: Send + Sync {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireStkPush<'a> {
    student_id: Uuid,
    invoice_id: Uuid,
    business_short_code: &'a str,
    phone_number: &'a str,
    amount: Decimal,
    account_reference: &'a str,
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct WireStkPushResponse {
    #[serde(default)]
    checkout_request_id: Option<String>,
    #[serde(default)]
    response_code: Option<String>,
    #[serde(default)]
    response_description: Option<String>,
    #[serde(default)]
    customer_message: Option<String>,
}

/// HTTP client for a gateway exposing an STK push endpoint.
pub struct HttpStkGateway {
    client: Client,
    base_url: String,
    shortcode: String,
}

impl HttpStkGateway {
    pub fn new(base_url: String, shortcode: String) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Connection(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            shortcode,
        })
    }

    fn wire_body<'a>(&'a self, request: &'a StkPushRequest) -> WireStkPush<'a> {
        WireStkPush {
            student_id: request.student_id,
            invoice_id: request.invoice_id,
            business_short_code: &self.shortcode,
            phone_number: &request.phone_number,
            amount: request.amount,
            account_reference: &request.account_reference,
            transaction_desc: format!("School fees {}", request.account_reference),
        }
    }
}

#[async_trait]
impl MobileMoneyGateway for HttpStkGateway {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError> {
        let timer = GATEWAY_REQUEST_DURATION
            .with_label_values(&["stk_push"])
            .start_timer();

        let body = self.wire_body(request);

        let url = format!("{}/stkpush", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        timer.observe_duration();

        tracing::debug!(status = %status, body = %text, "STK push response");

        if !status.is_success() {
            tracing::error!(status = %status, "STK push rejected by gateway");
            return Err(GatewayError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        let parsed: WireStkPushResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if parsed.response_code.as_deref().is_some_and(|code| code != "0") {
            return Err(GatewayError::Rejected(
                parsed
                    .response_description
                    .unwrap_or_else(|| "push not accepted".to_string()),
            ));
        }

        let checkout_request_id = parsed
            .checkout_request_id
            .ok_or_else(|| GatewayError::InvalidResponse("missing checkout_request_id".to_string()))?;

        tracing::info!(
            checkout_request_id = %checkout_request_id,
            invoice_id = %request.invoice_id,
            "STK push accepted"
        );

        Ok(StkPushAccepted {
            checkout_request_id,
            customer_message: parsed.customer_message,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Local gateway used when no gateway URL is configured.
///
/// Accepts every push (or rejects every push when built with
/// [`SandboxGateway::rejecting`]) and issues `ws_CO_`-style checkout ids.
pub struct SandboxGateway {
    accept: bool,
    push_count: AtomicU64,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            accept: true,
            push_count: AtomicU64::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            push_count: AtomicU64::new(0),
        }
    }

    pub fn push_count(&self) -> u64 {
        self.push_count.load(Ordering::SeqCst)
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MobileMoneyGateway for SandboxGateway {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError> {
        if !self.accept {
            return Err(GatewayError::Rejected(
                "Sandbox gateway is configured to reject pushes".to_string(),
            ));
        }

        self.push_count.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            phone_number = %request.phone_number,
            amount = %request.amount,
            "[SANDBOX] STK push would be sent"
        );

        Ok(StkPushAccepted {
            checkout_request_id: format!("ws_CO_{}", Uuid::new_v4().simple()),
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "sandbox"
    }
}
