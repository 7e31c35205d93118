//! Configuration module for paydesk-service.

use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::services::approvals::DEFAULT_APPROVAL_THRESHOLD;
use crate::services::impersonation::DEFAULT_MAX_MINUTES;

#[derive(Debug, Clone)]
pub struct PaydeskConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageBackend,
    pub approval_threshold: Decimal,
    pub gateway: GatewayConfig,
    pub impersonation_max_minutes: i64,
}

/// Where fee data lives.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Postgres(DatabaseConfig),
    /// In-process tables; data is lost on restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `None` runs the sandbox gateway.
    pub base_url: Option<String>,
    pub shortcode: String,
    pub callback_secret: Option<Secret<String>>,
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match non_empty(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

impl PaydeskConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let storage = match non_empty("STORAGE_BACKEND")
            .unwrap_or_else(|| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => StorageBackend::Postgres(DatabaseConfig {
                url: Secret::new(non_empty("DATABASE_URL").ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parsed("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            "memory" => StorageBackend::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown STORAGE_BACKEND '{}' (expected postgres or memory)",
                    other
                )))
            }
        };

        let approval_threshold = parsed(
            "APPROVAL_THRESHOLD",
            Decimal::from(DEFAULT_APPROVAL_THRESHOLD),
        )?;
        if approval_threshold < Decimal::ZERO {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "APPROVAL_THRESHOLD must not be negative"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "paydesk-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: non_empty("OTLP_ENDPOINT"),
            storage,
            approval_threshold,
            gateway: GatewayConfig {
                base_url: non_empty("MPESA_GATEWAY_URL"),
                shortcode: non_empty("MPESA_SHORTCODE").unwrap_or_else(|| "174379".to_string()),
                callback_secret: non_empty("MPESA_CALLBACK_SECRET").map(Secret::new),
            },
            impersonation_max_minutes: parsed("IMPERSONATION_MAX_MINUTES", DEFAULT_MAX_MINUTES)?,
        })
    }

    /// In-memory configuration with defaults, for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "paydesk-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            storage: StorageBackend::Memory,
            approval_threshold: Decimal::from(DEFAULT_APPROVAL_THRESHOLD),
            gateway: GatewayConfig {
                base_url: None,
                shortcode: "174379".to_string(),
                callback_secret: None,
            },
            impersonation_max_minutes: DEFAULT_MAX_MINUTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_defaults() {
        let config = PaydeskConfig::in_memory();
        assert!(matches!(config.storage, StorageBackend::Memory));
        assert_eq!(config.approval_threshold, Decimal::from(10_000));
        assert_eq!(config.impersonation_max_minutes, 60);
        assert!(config.gateway.base_url.is_none());
    }
}
