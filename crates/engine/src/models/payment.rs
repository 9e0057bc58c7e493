//! Payment attempt models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockroom_core::{CurrencyCode, OrderId, PaymentAttemptStatus, PaymentId};

/// One payment attempt against an order.
///
/// An order accumulates attempts over retries and partial settlement; the
/// order's derived payment status is recomputed from the full set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment ID.
    pub id: PaymentId,
    /// Order being paid.
    pub order_id: OrderId,
    /// Payment provider name, e.g. `stripe`.
    pub provider: String,
    /// The provider's id for this charge, once acknowledged.
    pub provider_payment_id: Option<String>,
    /// Amount charged.
    pub amount: Decimal,
    /// Currency of the charge, always the order's currency.
    pub currency: CurrencyCode,
    /// Attempt status.
    pub status: PaymentAttemptStatus,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

/// Parameters for recording a payment attempt.
#[derive(Debug, Clone)]
pub struct NewPayment {
    /// Order being paid.
    pub order_id: OrderId,
    /// Payment provider name.
    pub provider: String,
    /// Amount charged.
    pub amount: Decimal,
    /// Currency of the charge.
    pub currency: CurrencyCode,
}

/// The asynchronous result of a payment attempt, as reported by the
/// provider callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The charge settled.
    Successful,
    /// The charge failed.
    Failed,
}
