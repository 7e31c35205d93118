//! Payment recording, STK push initiation and callback reconciliation.

use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use sha2::Sha256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    CallbackOutcome, InvoiceStatus, NewPayment, Payment, PaymentMethod, PaymentStatus, Student,
};
use crate::services::gateway::{MobileMoneyGateway, StkPushRequest};
use crate::services::metrics::{CALLBACKS_TOTAL, PAYMENTS_TOTAL};
use crate::services::notifier::{notify_best_effort, Notification, Notifier};
use crate::services::store::{invoice_not_found, FeeStore};

/// Manually recorded payment (cash, bank transfer, cheque, card).
#[derive(Debug, Clone)]
pub struct ManualPayment {
    pub invoice_id: Option<Uuid>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: String,
}

/// Parameters of an STK push.
#[derive(Debug, Clone)]
pub struct StkPushInput {
    pub invoice_id: Uuid,
    pub phone_number: String,
    pub amount: Decimal,
    pub initiated_by: String,
}

/// Asynchronous payment result posted by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCallback {
    pub checkout_request_id: String,
    pub result_code: i32,
    #[serde(default)]
    pub result_desc: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

fn ensure_positive(amount: Decimal) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Payment amount must be greater than zero"
        )));
    }
    Ok(())
}

/// Normalize a payer phone number to international digits (`2547XXXXXXXX`).
pub fn normalize_phone(raw: &str) -> Result<String, AppError> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invalid phone number '{}'",
            raw
        )));
    }

    let normalized = match digits.strip_prefix('0') {
        Some(local) if local.len() == 9 => format!("254{}", local),
        _ => digits,
    };

    if !(10..=15).contains(&normalized.len()) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invalid phone number '{}'",
            raw
        )));
    }
    Ok(normalized)
}

/// Verify a hex HMAC-SHA256 signature over the raw callback body.
pub fn verify_callback_signature(
    secret: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), AppError> {
    let signature = signature.ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Missing callback signature"))
    })?;
    let expected = hex::decode(signature.trim()).map_err(|_| {
        AppError::Unauthorized(anyhow::anyhow!("Malformed callback signature"))
    })?;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::InternalError(anyhow::anyhow!("Invalid key length")))?;
    mac.update(body);

    mac.verify_slice(&expected).map_err(|_| {
        warn!("Callback signature verification failed");
        AppError::Unauthorized(anyhow::anyhow!("Invalid callback signature"))
    })
}

/// Hex HMAC-SHA256 of `body`, as the gateway computes it.
pub fn sign_callback(secret: &str, body: &[u8]) -> Result<String, AppError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::InternalError(anyhow::anyhow!("Invalid key length")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Record a completed manual payment and apply it to its invoice.
#[instrument(skip(store, notifier, student, input), fields(student_id = %student.student_id, amount = %input.amount))]
pub async fn record_payment(
    store: &dyn FeeStore,
    notifier: &dyn Notifier,
    student: &Student,
    input: ManualPayment,
    today: NaiveDate,
) -> Result<Payment, AppError> {
    ensure_positive(input.amount)?;
    if input.method == PaymentMethod::Mpesa {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "M-Pesa payments are collected through an STK push"
        )));
    }

    let payment = store
        .record_payment(
            &NewPayment {
                school_id: student.school_id,
                student_id: student.student_id,
                invoice_id: input.invoice_id,
                amount: input.amount,
                method: input.method,
                status: PaymentStatus::Completed,
                reference: input.reference.filter(|r| !r.trim().is_empty()),
                phone_number: None,
                checkout_request_id: None,
                recorded_by: Some(input.recorded_by),
            },
            today,
        )
        .await?;

    PAYMENTS_TOTAL
        .with_label_values(&[payment.method.as_str(), payment.status.as_str()])
        .inc();

    notify_best_effort(
        notifier,
        Notification::PaymentReceived {
            school_id: payment.school_id,
            student_id: payment.student_id,
            payment_id: payment.payment_id,
            amount: payment.amount,
        },
    )
    .await;

    Ok(payment)
}

/// Ask the gateway to prompt the payer, then record the pending payment.
#[instrument(skip(store, gateway, student, input), fields(student_id = %student.student_id, invoice_id = %input.invoice_id))]
pub async fn initiate_stk_push(
    store: &dyn FeeStore,
    gateway: &dyn MobileMoneyGateway,
    student: &Student,
    input: StkPushInput,
    today: NaiveDate,
) -> Result<Payment, AppError> {
    ensure_positive(input.amount)?;
    let phone_number = normalize_phone(&input.phone_number)?;

    let invoice = store
        .get_invoice(student.school_id, input.invoice_id)
        .await?
        .ok_or_else(|| invoice_not_found(input.invoice_id))?;
    if invoice.student_id != student.student_id {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice {} does not belong to student {}",
            invoice.invoice_number,
            student.admission_number
        )));
    }
    if invoice.status == InvoiceStatus::Cancelled {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Invoice {} is cancelled",
            invoice.invoice_number
        )));
    }

    let accepted = gateway
        .stk_push(&StkPushRequest {
            student_id: student.student_id,
            invoice_id: invoice.invoice_id,
            phone_number: phone_number.clone(),
            amount: input.amount,
            account_reference: invoice.invoice_number.clone(),
        })
        .await
        .map_err(|e| {
            warn!(gateway = gateway.name(), error = %e, "STK push failed");
            AppError::BadGateway(e.to_string())
        })?;

    let payment = store
        .record_payment(
            &NewPayment {
                school_id: student.school_id,
                student_id: student.student_id,
                invoice_id: Some(invoice.invoice_id),
                amount: input.amount,
                method: PaymentMethod::Mpesa,
                status: PaymentStatus::Pending,
                reference: Some(invoice.invoice_number.clone()),
                phone_number: Some(phone_number),
                checkout_request_id: Some(accepted.checkout_request_id),
                recorded_by: Some(input.initiated_by),
            },
            today,
        )
        .await?;

    PAYMENTS_TOTAL
        .with_label_values(&[payment.method.as_str(), payment.status.as_str()])
        .inc();
    info!(payment_id = %payment.payment_id, "STK push initiated");

    Ok(payment)
}

/// Apply a gateway callback to its pending payment, at most once.
#[instrument(skip(store, notifier, callback), fields(checkout_request_id = %callback.checkout_request_id, result_code = callback.result_code))]
pub async fn reconcile_callback(
    store: &dyn FeeStore,
    notifier: &dyn Notifier,
    callback: &GatewayCallback,
    now: DateTime<Utc>,
) -> Result<(Payment, CallbackOutcome), AppError> {
    let (payment, outcome) = if callback.result_code == 0 {
        let transaction_id = callback
            .transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Successful callback is missing transaction_id"
                ))
            })?;

        if let (Some(reported), Some(pending)) = (
            callback.amount,
            store.get_payment_by_checkout(&callback.checkout_request_id).await?,
        ) {
            if reported != pending.amount {
                warn!(
                    reported = %reported,
                    expected = %pending.amount,
                    "Callback amount differs from the requested amount"
                );
            }
        }

        store
            .complete_mobile_payment(
                &callback.checkout_request_id,
                transaction_id,
                now,
                now.date_naive(),
            )
            .await?
    } else {
        info!(
            result_desc = callback.result_desc.as_deref().unwrap_or(""),
            "Gateway reported a failed payment"
        );
        store.fail_mobile_payment(&callback.checkout_request_id).await?
    };

    CALLBACKS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
    if outcome != CallbackOutcome::Duplicate {
        PAYMENTS_TOTAL
            .with_label_values(&[payment.method.as_str(), payment.status.as_str()])
            .inc();
    }

    if outcome == CallbackOutcome::Applied {
        notify_best_effort(
            notifier,
            Notification::PaymentReceived {
                school_id: payment.school_id,
                student_id: payment.student_id,
                payment_id: payment.payment_id,
                amount: payment.amount,
            },
        )
        .await;
    }

    Ok((payment, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_numbers_gain_the_country_code() {
        assert_eq!(normalize_phone("0712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("+254 712-345-678").unwrap(), "254712345678");
        assert!(normalize_phone("07123").is_err());
        assert!(normalize_phone("not a phone").is_err());
    }

    #[test]
    fn signature_round_trip_and_tamper_detection() {
        let body = br#"{"checkout_request_id":"ws_CO_1","result_code":0}"#;
        let signature = sign_callback("s3cret", body).unwrap();

        assert!(verify_callback_signature("s3cret", body, Some(signature.as_str())).is_ok());
        assert!(verify_callback_signature("other", body, Some(signature.as_str())).is_err());
        assert!(verify_callback_signature("s3cret", b"{}", Some(signature.as_str())).is_err());
        assert!(verify_callback_signature("s3cret", body, None).is_err());
        assert!(verify_callback_signature("s3cret", body, Some("zz")).is_err());
    }
}
