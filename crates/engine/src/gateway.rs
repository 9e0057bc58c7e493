//! Payment gateway collaborator.

use std::future::Future;

use rust_decimal::Decimal;
use stockroom_core::{CurrencyCode, OrderId};
use uuid::Uuid;

/// A charge submitted to the payment provider.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Order being paid.
    pub order_id: OrderId,
    /// Human-readable order number, for provider-side reconciliation.
    pub order_number: String,
    /// Amount to charge.
    pub amount: Decimal,
    /// Currency of the charge.
    pub currency: CurrencyCode,
}

/// The provider's synchronous acknowledgement of a charge.
#[derive(Debug, Clone)]
pub struct ChargeAck {
    /// The provider's id for the charge, stored on the payment for later
    /// reconciliation.
    pub provider_payment_id: String,
}

/// Gateway failures, split by what the coordinator should do with the
/// in-flight payment.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The provider rejected the charge outright; the payment is marked
    /// failed.
    #[error("charge declined: {reason}")]
    Declined {
        /// Provider-supplied decline reason.
        reason: String,
    },
    /// No answer in time; the payment stays initiated until a result
    /// arrives or the reconciliation sweep expires it.
    #[error("gateway timed out")]
    Timeout,
    /// The provider could not be reached; treated like a timeout.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// The external payment provider.
///
/// `charge` submits the charge and returns the provider's synchronous
/// acknowledgement. The definitive outcome usually arrives later through
/// the provider's callback, which callers feed to the payment
/// coordinator's `mark_result`.
pub trait PaymentGateway: Send + Sync + 'static {
    /// Submit a charge to the provider.
    fn charge(
        &self,
        request: ChargeRequest,
    ) -> impl Future<Output = Result<ChargeAck, GatewayError>> + Send;
}

/// A gateway that acknowledges every charge with a generated provider id.
///
/// Useful for embedding the engine without a real provider and as the
/// default gateway in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGateway;

impl StaticGateway {
    /// Create the gateway.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PaymentGateway for StaticGateway {
    async fn charge(&self, _request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
        Ok(ChargeAck {
            provider_payment_id: format!("static-{}", Uuid::new_v4()),
        })
    }
}
