//! Engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! All optional; defaults are production-safe.
//!
//! - `STOCKROOM_DATABASE_URL` - `PostgreSQL` connection string (falls back
//!   to `DATABASE_URL`); only needed with the `postgres` feature
//! - `STOCKROOM_ALLOW_PARTIAL_PROCESSING` - accept partially paid orders
//!   into processing (default: false)
//! - `STOCKROOM_RETURN_POLICY` - `delivered_only` or `shipped_or_delivered`
//!   (default: `delivered_only`)
//! - `STOCKROOM_REFUND_SETS_ORDER_STATUS` - move fully refunded delivered
//!   orders to `refunded` (default: false)
//! - `STOCKROOM_PAYMENT_TIMEOUT_MINUTES` - age after which initiated
//!   payments are swept to failed (default: 30)
//! - `STOCKROOM_ORDER_NUMBER_ATTEMPTS` - order number regenerations before
//!   giving up on a collision (default: 5)
//! - `STOCKROOM_INSERT_RETRY_ATTEMPTS` - transient insert retries before
//!   compensating (default: 3)
//! - `STOCKROOM_STOCK_RETRY_ATTEMPTS` - retries of a conflicted stock
//!   adjustment (default: 3)
//! - `STOCKROOM_STOCK_RETRY_BACKOFF_MS` - base backoff between stock
//!   retries (default: 20)

use secrecy::SecretString;
use stockroom_core::OrderStatus;
use thiserror::Error;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Which order statuses accept a new return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnPolicy {
    /// Returns only on delivered orders.
    #[default]
    DeliveredOnly,
    /// Returns on shipped orders too, for carriers that support
    /// return-to-sender before delivery.
    ShippedOrDelivered,
}

impl ReturnPolicy {
    /// Whether an order in `status` may have a return opened against it.
    #[must_use]
    pub const fn allows(self, status: OrderStatus) -> bool {
        match self {
            Self::DeliveredOnly => matches!(status, OrderStatus::Delivered),
            Self::ShippedOrDelivered => {
                matches!(status, OrderStatus::Shipped | OrderStatus::Delivered)
            }
        }
    }
}

impl std::fmt::Display for ReturnPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeliveredOnly => write!(f, "delivered_only"),
            Self::ShippedOrDelivered => write!(f, "shipped_or_delivered"),
        }
    }
}

impl std::str::FromStr for ReturnPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered_only" => Ok(Self::DeliveredOnly),
            "shipped_or_delivered" => Ok(Self::ShippedOrDelivered),
            _ => Err(format!("invalid return policy: {s}")),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `PostgreSQL` connection URL (contains password); unused by the
    /// in-memory store.
    pub database_url: Option<SecretString>,
    /// Accept partially paid orders into processing.
    pub allow_partial_processing: bool,
    /// Which order statuses accept a new return.
    pub return_policy: ReturnPolicy,
    /// Move a delivered order to refunded when a completed return drives
    /// its payment status to refunded.
    pub refund_sets_order_status: bool,
    /// Age in minutes after which initiated payments are swept to failed.
    pub payment_timeout_minutes: i64,
    /// Order number regenerations to attempt on collision.
    pub order_number_attempts: u32,
    /// Transient order-insert retries before compensating.
    pub insert_retry_attempts: u32,
    /// Retries of a conflicted stock adjustment.
    pub stock_retry_attempts: u32,
    /// Base backoff in milliseconds between stock retries; jitter of the
    /// same magnitude is added per attempt.
    pub stock_retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            allow_partial_processing: false,
            return_policy: ReturnPolicy::DeliveredOnly,
            refund_sets_order_status: false,
            payment_timeout_minutes: 30,
            order_number_attempts: 5,
            insert_retry_attempts: 3,
            stock_retry_attempts: 3,
            stock_retry_backoff_ms: 20,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present. Every
    /// variable is optional; see the module docs for names and defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            database_url: get_database_url("STOCKROOM_DATABASE_URL"),
            allow_partial_processing: get_parsed_or(
                "STOCKROOM_ALLOW_PARTIAL_PROCESSING",
                defaults.allow_partial_processing,
            )?,
            return_policy: get_parsed_or("STOCKROOM_RETURN_POLICY", defaults.return_policy)?,
            refund_sets_order_status: get_parsed_or(
                "STOCKROOM_REFUND_SETS_ORDER_STATUS",
                defaults.refund_sets_order_status,
            )?,
            payment_timeout_minutes: get_parsed_or(
                "STOCKROOM_PAYMENT_TIMEOUT_MINUTES",
                defaults.payment_timeout_minutes,
            )?,
            order_number_attempts: get_parsed_or(
                "STOCKROOM_ORDER_NUMBER_ATTEMPTS",
                defaults.order_number_attempts,
            )?,
            insert_retry_attempts: get_parsed_or(
                "STOCKROOM_INSERT_RETRY_ATTEMPTS",
                defaults.insert_retry_attempts,
            )?,
            stock_retry_attempts: get_parsed_or(
                "STOCKROOM_STOCK_RETRY_ATTEMPTS",
                defaults.stock_retry_attempts,
            )?,
            stock_retry_backoff_ms: get_parsed_or(
                "STOCKROOM_STOCK_RETRY_BACKOFF_MS",
                defaults.stock_retry_backoff_ms,
            )?,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Option<SecretString> {
    std::env::var(primary_key)
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
        .map(SecretString::from)
}

/// Parse an optional environment variable, falling back to a default.
fn get_parsed_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
