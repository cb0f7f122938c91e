//! Configuration module for reconciliation-service.

use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` selects the in-memory stores.
    pub database: Option<DatabaseConfig>,
    pub payment_ledger: PaymentLedgerConfig,
    pub matching: MatchingConfig,
    pub discrepancy: DiscrepancyConfig,
    pub import: ImportConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PaymentLedgerConfig {
    /// `None` selects the in-memory payment ledger (local development only).
    pub url: Option<String>,
    pub timeout: Duration,
    pub write_retry: RetryConfig,
}

/// Thresholds used by the matching strategies.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub exact_date_window_days: i64,
    pub rule_confidence_floor: Decimal,
    pub fuzzy_amount_percent: Decimal,
    pub fuzzy_date_window_days: i64,
    pub fuzzy_base_confidence: Decimal,
    pub fuzzy_confidence_floor: Decimal,
    /// Minimum confidence for import to bind a transaction automatically.
    pub auto_match_threshold: Decimal,
    pub suggestion_amount_percent: Decimal,
    pub suggestion_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            exact_date_window_days: 7,
            rule_confidence_floor: Decimal::from(50),
            fuzzy_amount_percent: Decimal::from(5),
            fuzzy_date_window_days: 14,
            fuzzy_base_confidence: Decimal::from(80),
            fuzzy_confidence_floor: Decimal::from(30),
            auto_match_threshold: Decimal::from(80),
            suggestion_amount_percent: Decimal::from(20),
            suggestion_limit: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscrepancyConfig {
    pub amount_tolerance: Decimal,
    pub date_tolerance_days: i64,
}

impl Default for DiscrepancyConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: Decimal::new(1, 2),
            date_tolerance_days: 14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Hard cap on records processed per import call.
    pub max_batch: usize,
    /// Transactions matched concurrently within one batch.
    pub concurrency: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_batch: 1000,
            concurrency: 8,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MatchingConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            exact_date_window_days: env_parse("RECON_EXACT_DATE_WINDOW_DAYS", d.exact_date_window_days),
            rule_confidence_floor: env_parse("RECON_RULE_CONFIDENCE_FLOOR", d.rule_confidence_floor),
            fuzzy_amount_percent: env_parse("RECON_FUZZY_AMOUNT_PERCENT", d.fuzzy_amount_percent),
            fuzzy_date_window_days: env_parse("RECON_FUZZY_DATE_WINDOW_DAYS", d.fuzzy_date_window_days),
            fuzzy_base_confidence: env_parse("RECON_FUZZY_BASE_CONFIDENCE", d.fuzzy_base_confidence),
            fuzzy_confidence_floor: env_parse("RECON_FUZZY_CONFIDENCE_FLOOR", d.fuzzy_confidence_floor),
            auto_match_threshold: env_parse("RECON_AUTO_MATCH_THRESHOLD", d.auto_match_threshold),
            suggestion_amount_percent: env_parse(
                "RECON_SUGGESTION_AMOUNT_PERCENT",
                d.suggestion_amount_percent,
            ),
            suggestion_limit: env_parse("RECON_SUGGESTION_LIMIT", d.suggestion_limit),
        }
    }
}

impl DiscrepancyConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            amount_tolerance: env_parse("RECON_DISCREPANCY_AMOUNT_TOLERANCE", d.amount_tolerance),
            date_tolerance_days: env_parse("RECON_DISCREPANCY_DATE_TOLERANCE_DAYS", d.date_tolerance_days),
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = env::var("DATABASE_URL").ok().map(|url| DatabaseConfig {
            url: Secret::new(url),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
        });

        let import = ImportConfig {
            max_batch: env_parse("IMPORT_MAX_BATCH", ImportConfig::default().max_batch),
            concurrency: env_parse("IMPORT_CONCURRENCY", ImportConfig::default().concurrency),
        };
        if import.max_batch == 0 || import.concurrency == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPORT_MAX_BATCH and IMPORT_CONCURRENCY must be positive"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database,
            payment_ledger: PaymentLedgerConfig {
                url: env::var("PAYMENT_LEDGER_URL").ok().filter(|s| !s.is_empty()),
                timeout: Duration::from_secs(env_parse("PAYMENT_LEDGER_TIMEOUT_SECS", 10)),
                write_retry: RetryConfig::with_max_retries(env_parse("PAYMENT_WRITE_MAX_RETRIES", 3)),
            },
            matching: MatchingConfig::from_env(),
            discrepancy: DiscrepancyConfig::from_env(),
            import,
        })
    }

    /// Configuration for in-process use: in-memory stores, default thresholds.
    pub fn in_memory() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "reconciliation-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: None,
            payment_ledger: PaymentLedgerConfig {
                url: None,
                timeout: Duration::from_secs(10),
                write_retry: RetryConfig::quick(),
            },
            matching: MatchingConfig::default(),
            discrepancy: DiscrepancyConfig::default(),
            import: ImportConfig::default(),
        }
    }
}
