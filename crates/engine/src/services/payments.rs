//! Payment coordinator.
//!
//! Records payment attempts, submits them to the gateway, applies the
//! provider's asynchronous outcome, and keeps each order's derived
//! payment standing in sync with the sum of its settled and refunded
//! attempts. All writes for an order run under that order's lock.
//!
//! Overpayment is checked twice: optimistically when an attempt is
//! recorded, and again when the provider reports success, so two
//! attempts raced through the gateway can never both settle past the
//! order total. The loser is marked failed and the caller told why.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use stockroom_core::{OrderId, OrderStatus, PaymentAttemptStatus, PaymentId, PaymentStatus};
use tracing::{info, instrument, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gateway::{ChargeRequest, GatewayError, PaymentGateway};
use crate::lock::EntityLocks;
use crate::models::{NewPayment, Order, Payment, PaymentOutcome};
use crate::store::Store;

/// Derive an order's payment standing from its payment attempts.
///
/// `refunded` only when refunds exist and nothing remains settled;
/// otherwise the settled sum against the order total decides. A
/// zero-total order with nothing settled counts as paid.
#[must_use]
pub fn derive_payment_status(payments: &[Payment], total: Decimal) -> PaymentStatus {
    let settled: Decimal = payments
        .iter()
        .filter(|p| p.status == PaymentAttemptStatus::Successful)
        .map(|p| p.amount)
        .sum();
    let refunded: Decimal = payments
        .iter()
        .filter(|p| p.status == PaymentAttemptStatus::Refunded)
        .map(|p| p.amount)
        .sum();

    if refunded > Decimal::ZERO && settled == Decimal::ZERO {
        PaymentStatus::Refunded
    } else if settled >= total {
        PaymentStatus::Paid
    } else if settled > Decimal::ZERO {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Unpaid
    }
}

/// Payment coordinator service.
pub struct PaymentCoordinator<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    locks: Arc<EntityLocks<OrderId>>,
    activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
}

impl<S, G> Clone for PaymentCoordinator<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            locks: Arc::clone(&self.locks),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

impl<S: Store, G: PaymentGateway> PaymentCoordinator<S, G> {
    pub(crate) fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        locks: Arc<EntityLocks<OrderId>>,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            activity,
            config,
        }
    }

    /// Record a payment attempt and submit the charge to the gateway.
    ///
    /// The attempt is persisted as `initiated` before the gateway is
    /// called, so a crash mid-charge leaves a record for the
    /// reconciliation sweep. A declined charge comes back as a `failed`
    /// payment; a gateway timeout leaves it `initiated` for
    /// [`expire_stale`](Self::expire_stale) to collect. The charge
    /// always uses the order's currency.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a non-positive amount or
    /// an order that is cancelled or refunded,
    /// [`EngineError::NotFound`] if the order does not exist,
    /// [`EngineError::Overpayment`] if the amount would push the settled
    /// sum past the order total, or [`EngineError::Persistence`] if the
    /// store fails.
    #[instrument(skip(self), fields(order = %order_id, amount = %amount))]
    pub async fn record_attempt(
        &self,
        order_id: OrderId,
        provider: &str,
        amount: Decimal,
    ) -> Result<Payment, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation(
                "payment amount must be positive",
            ));
        }

        let _guard = self.locks.acquire(order_id).await;

        let Some(order) = self.store.order(order_id).await? else {
            return Err(EngineError::not_found("order", order_id));
        };
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Err(EngineError::validation(format!(
                "cannot record a payment against a {} order",
                order.status
            )));
        }

        let settled = self.settled_sum(order_id).await?;
        if settled + amount > order.total {
            return Err(EngineError::Overpayment {
                order: order_id,
                attempted: settled + amount,
                total: order.total,
            });
        }

        let payment = self
            .store
            .insert_payment(NewPayment {
                order_id,
                provider: provider.to_string(),
                amount,
                currency: order.currency,
            })
            .await?;

        match self
            .gateway
            .charge(ChargeRequest {
                order_id,
                order_number: order.order_number.clone(),
                amount,
                currency: order.currency,
            })
            .await
        {
            Ok(ack) => {
                self.store
                    .set_provider_payment_id(payment.id, &ack.provider_payment_id)
                    .await?;
                info!(payment_id = %payment.id, provider_payment_id = %ack.provider_payment_id, "Charge submitted");
            }
            Err(GatewayError::Declined { reason }) => {
                warn!(payment_id = %payment.id, reason = %reason, "Charge declined");
                self.store
                    .set_payment_attempt_status(
                        payment.id,
                        PaymentAttemptStatus::Initiated,
                        PaymentAttemptStatus::Failed,
                    )
                    .await?;
            }
            Err(e @ (GatewayError::Timeout | GatewayError::Unavailable(_))) => {
                // The provider may still settle this charge; leave it
                // initiated for the callback or the reconciliation sweep.
                warn!(payment_id = %payment.id, error = %e, "Gateway unreachable, payment left initiated");
            }
        }

        self.activity.record(ActivityEvent::new(
            "payment",
            payment.id,
            "recorded",
            json!({ "order_id": order_id, "amount": amount, "provider": provider }),
        ));

        self.require_payment(payment.id).await
    }

    /// Apply the provider's outcome for an `initiated` payment.
    ///
    /// A success re-checks the overpayment guard against what settled
    /// since the attempt was recorded; if the guard trips, the payment
    /// is marked failed and the error says so.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the payment does not exist,
    /// [`EngineError::InvalidTransition`] if it is not `initiated`,
    /// [`EngineError::Overpayment`] if settling it would pass the order
    /// total, [`EngineError::Conflict`] if it changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(payment = %payment_id))]
    pub async fn mark_result(
        &self,
        payment_id: PaymentId,
        outcome: PaymentOutcome,
        provider_payment_id: Option<&str>,
    ) -> Result<Payment, EngineError> {
        let Some(found) = self.store.payment(payment_id).await? else {
            return Err(EngineError::not_found("payment", payment_id));
        };

        let _guard = self.locks.acquire(found.order_id).await;

        // Re-read under the lock; the first read only located the order.
        let payment = self.require_payment(payment_id).await?;
        let target = match outcome {
            PaymentOutcome::Successful => PaymentAttemptStatus::Successful,
            PaymentOutcome::Failed => PaymentAttemptStatus::Failed,
        };
        if payment.status != PaymentAttemptStatus::Initiated {
            return Err(EngineError::invalid_transition(
                "payment",
                payment.status,
                target,
            ));
        }

        if let Some(provider_id) = provider_payment_id {
            self.store
                .set_provider_payment_id(payment_id, provider_id)
                .await?;
        }

        if outcome == PaymentOutcome::Successful {
            let Some(order) = self.store.order(payment.order_id).await? else {
                return Err(EngineError::not_found("order", payment.order_id));
            };
            let settled = self.settled_sum(order.id).await?;
            if settled + payment.amount > order.total {
                self.store
                    .set_payment_attempt_status(
                        payment_id,
                        PaymentAttemptStatus::Initiated,
                        PaymentAttemptStatus::Failed,
                    )
                    .await?;
                warn!(
                    payment_id = %payment_id,
                    order_id = %order.id,
                    "Settlement would overpay the order; payment marked failed"
                );
                return Err(EngineError::Overpayment {
                    order: order.id,
                    attempted: settled + payment.amount,
                    total: order.total,
                });
            }
        }

        if !self
            .store
            .set_payment_attempt_status(payment_id, PaymentAttemptStatus::Initiated, target)
            .await?
        {
            return Err(EngineError::conflict(format!(
                "payment {payment_id} changed status concurrently"
            )));
        }

        if target == PaymentAttemptStatus::Successful {
            self.recompute_payment_status(payment.order_id).await?;
        }

        info!(payment_id = %payment_id, outcome = %target, "Payment outcome applied");
        self.activity.record(ActivityEvent::new(
            "payment",
            payment_id,
            match outcome {
                PaymentOutcome::Successful => "settled",
                PaymentOutcome::Failed => "failed",
            },
            json!({ "order_id": payment.order_id, "amount": payment.amount }),
        ));

        self.require_payment(payment_id).await
    }

    /// Refund a settled payment in full.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the payment does not exist,
    /// [`EngineError::InvalidTransition`] if it is not `successful`,
    /// [`EngineError::Conflict`] if it changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(payment = %payment_id))]
    pub async fn refund(&self, payment_id: PaymentId) -> Result<Payment, EngineError> {
        let Some(found) = self.store.payment(payment_id).await? else {
            return Err(EngineError::not_found("payment", payment_id));
        };

        let _guard = self.locks.acquire(found.order_id).await;

        let payment = self.require_payment(payment_id).await?;
        if payment.status != PaymentAttemptStatus::Successful {
            return Err(EngineError::invalid_transition(
                "payment",
                payment.status,
                PaymentAttemptStatus::Refunded,
            ));
        }
        if !self
            .store
            .set_payment_attempt_status(
                payment_id,
                PaymentAttemptStatus::Successful,
                PaymentAttemptStatus::Refunded,
            )
            .await?
        {
            return Err(EngineError::conflict(format!(
                "payment {payment_id} changed status concurrently"
            )));
        }
        self.recompute_payment_status(payment.order_id).await?;

        info!(payment_id = %payment_id, amount = %payment.amount, "Payment refunded");
        self.activity.record(ActivityEvent::new(
            "payment",
            payment_id,
            "refunded",
            json!({ "order_id": payment.order_id, "amount": payment.amount }),
        ));

        self.require_payment(payment_id).await
    }

    /// Mark `initiated` payments older than the configured timeout as
    /// failed. Returns how many were expired.
    ///
    /// Run this periodically; it is how charges that never got a
    /// provider callback stop counting as in-flight.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<u64, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.payment_timeout_minutes);
        let stale = self.store.initiated_payments_before(cutoff).await?;

        let mut expired: u64 = 0;
        for candidate in stale {
            let _guard = self.locks.acquire(candidate.order_id).await;

            // A callback may have settled it while we waited for the lock.
            let Some(payment) = self.store.payment(candidate.id).await? else {
                continue;
            };
            if payment.status != PaymentAttemptStatus::Initiated || payment.created_at >= cutoff {
                continue;
            }
            if self
                .store
                .set_payment_attempt_status(
                    payment.id,
                    PaymentAttemptStatus::Initiated,
                    PaymentAttemptStatus::Failed,
                )
                .await?
            {
                expired += 1;
                self.activity.record(ActivityEvent::new(
                    "payment",
                    payment.id,
                    "expired",
                    json!({ "order_id": payment.order_id, "amount": payment.amount }),
                ));
            }
        }

        if expired > 0 {
            info!(expired, "Expired stale payment attempts");
        }
        Ok(expired)
    }

    /// Fetch a payment by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, EngineError> {
        Ok(self.store.payment(id).await?)
    }

    /// Fetch an order's payments, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>, EngineError> {
        Ok(self.store.payments_for_order(order_id).await?)
    }

    /// Refund settled payments, newest first, until at least `amount` is
    /// covered. The last payment flipped may overshoot; refunds are
    /// all-or-nothing per payment. Returns the sum actually refunded.
    ///
    /// The caller must hold the order's lock.
    pub(crate) async fn refund_up_to(
        &self,
        order: &Order,
        amount: Decimal,
    ) -> Result<Decimal, EngineError> {
        let payments = self.store.payments_for_order(order.id).await?;
        let mut settled: Vec<&Payment> = payments
            .iter()
            .filter(|p| p.status == PaymentAttemptStatus::Successful)
            .collect();
        let available: Decimal = settled.iter().map(|p| p.amount).sum();
        if available < amount {
            return Err(EngineError::validation(format!(
                "settled payments cover {available}, cannot refund {amount}"
            )));
        }

        settled.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut flipped = Decimal::ZERO;
        for payment in settled {
            if flipped >= amount {
                break;
            }
            if !self
                .store
                .set_payment_attempt_status(
                    payment.id,
                    PaymentAttemptStatus::Successful,
                    PaymentAttemptStatus::Refunded,
                )
                .await?
            {
                return Err(EngineError::conflict(format!(
                    "payment {} changed status concurrently",
                    payment.id
                )));
            }
            flipped += payment.amount;
            self.activity.record(ActivityEvent::new(
                "payment",
                payment.id,
                "refunded",
                json!({ "order_id": order.id, "amount": payment.amount }),
            ));
        }

        self.recompute_payment_status(order.id).await?;
        Ok(flipped)
    }

    /// Recompute and persist the order's derived payment standing.
    ///
    /// The caller must hold the order's lock.
    pub(crate) async fn recompute_payment_status(
        &self,
        order_id: OrderId,
    ) -> Result<(), EngineError> {
        let Some(order) = self.store.order(order_id).await? else {
            return Err(EngineError::not_found("order", order_id));
        };
        let payments = self.store.payments_for_order(order_id).await?;
        let derived = derive_payment_status(&payments, order.total);
        if order.payment_status != derived
            && !self.store.set_payment_status(order_id, derived).await?
        {
            warn!(order_id = %order_id, "Order vanished during payment status recompute");
        }
        Ok(())
    }

    async fn settled_sum(&self, order_id: OrderId) -> Result<Decimal, EngineError> {
        let payments = self.store.payments_for_order(order_id).await?;
        Ok(payments
            .iter()
            .filter(|p| p.status == PaymentAttemptStatus::Successful)
            .map(|p| p.amount)
            .sum())
    }

    async fn require_payment(&self, id: PaymentId) -> Result<Payment, EngineError> {
        match self.store.payment(id).await? {
            Some(payment) => Ok(payment),
            None => Err(EngineError::not_found("payment", id)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::activity::MemoryActivityLog;
    use crate::gateway::{ChargeAck, StaticGateway};
    use crate::models::{CartLine, CheckoutCharges, NewAddress, NewCustomer, NewProduct};
    use crate::services::inventory::InventoryLedger;
    use crate::services::orders::OrderBuilder;
    use crate::store::MemoryStore;
    use stockroom_core::{CurrencyCode, WarehouseId};

    const WAREHOUSE: WarehouseId = WarehouseId::new(1);

    struct DecliningGateway;

    impl PaymentGateway for DecliningGateway {
        async fn charge(&self, _request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
            Err(GatewayError::Declined {
                reason: "card declined".to_string(),
            })
        }
    }

    struct SilentGateway;

    impl PaymentGateway for SilentGateway {
        async fn charge(&self, _request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
            Err(GatewayError::Timeout)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        locks: Arc<EntityLocks<OrderId>>,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
        coordinator: PaymentCoordinator<MemoryStore, StaticGateway>,
        order: Order,
    }

    /// Seeds one order for 2 x 10.00 with no extra charges: total 20.00.
    async fn fixture_with(config: EngineConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let activity: Arc<dyn ActivityLog> = Arc::new(MemoryActivityLog::new());
        let locks = Arc::new(EntityLocks::new());
        let inventory = InventoryLedger::new(
            Arc::clone(&store),
            Arc::clone(&activity),
            config.clone(),
        );
        let builder = OrderBuilder::new(
            Arc::clone(&store),
            inventory.clone(),
            Arc::clone(&activity),
            config.clone(),
        );
        let coordinator = PaymentCoordinator::new(
            Arc::clone(&store),
            Arc::new(StaticGateway::new()),
            Arc::clone(&locks),
            Arc::clone(&activity),
            config.clone(),
        );

        let customer = store
            .insert_customer(NewCustomer {
                email: "buyer@example.com".parse().unwrap(),
                name: "Buyer".to_string(),
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap();
        let address = store
            .insert_address(NewAddress {
                customer_id: customer.id,
                line1: "1 Main St".to_string(),
                line2: None,
                city: "Springfield".to_string(),
                region: None,
                postal_code: "97477".to_string(),
                country: "US".to_string(),
            })
            .await
            .unwrap();
        let product = store
            .insert_product(NewProduct {
                sku: "WIDGET-01".parse().unwrap(),
                name: "Widget".to_string(),
                description: None,
                price: "10.00".parse().unwrap(),
                category_id: None,
                active: true,
                images: Vec::new(),
                suppliers: Vec::new(),
                tags: Vec::new(),
            })
            .await
            .unwrap();
        inventory.restock(product.id, WAREHOUSE, 10).await.unwrap();

        let order = builder
            .place_order(
                customer.id,
                &[CartLine {
                    product_id: product.id,
                    warehouse_id: WAREHOUSE,
                    quantity: 2,
                }],
                address.id,
                address.id,
                CheckoutCharges {
                    shipping_cost: "0.00".parse().unwrap(),
                    tax: "0.00".parse().unwrap(),
                    currency: CurrencyCode::USD,
                },
            )
            .await
            .unwrap();

        Fixture {
            store,
            locks,
            activity,
            config,
            coordinator,
            order,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig::default()).await
    }

    fn coordinator_with<G: PaymentGateway>(
        fixture: &Fixture,
        gateway: G,
    ) -> PaymentCoordinator<MemoryStore, G> {
        PaymentCoordinator::new(
            Arc::clone(&fixture.store),
            Arc::new(gateway),
            Arc::clone(&fixture.locks),
            Arc::clone(&fixture.activity),
            fixture.config.clone(),
        )
    }

    async fn order_payment_status(fixture: &Fixture) -> PaymentStatus {
        fixture
            .store
            .order(fixture.order.id)
            .await
            .unwrap()
            .unwrap()
            .payment_status
    }

    fn sample_payment(id: i32, amount: &str, status: PaymentAttemptStatus) -> Payment {
        Payment {
            id: PaymentId::new(id),
            order_id: OrderId::new(1),
            provider: "test".to_string(),
            provider_payment_id: None,
            amount: amount.parse().unwrap(),
            currency: CurrencyCode::USD,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_derive_payment_status_cases() {
        use PaymentAttemptStatus::{Failed, Initiated, Refunded, Successful};

        let total: Decimal = "20.00".parse().unwrap();
        let zero = Decimal::ZERO;

        assert_eq!(derive_payment_status(&[], total), PaymentStatus::Unpaid);
        assert_eq!(derive_payment_status(&[], zero), PaymentStatus::Paid);
        assert_eq!(
            derive_payment_status(&[sample_payment(1, "5.00", Successful)], total),
            PaymentStatus::Partial
        );
        assert_eq!(
            derive_payment_status(
                &[
                    sample_payment(1, "5.00", Successful),
                    sample_payment(2, "15.00", Successful),
                ],
                total
            ),
            PaymentStatus::Paid
        );
        // Initiated and failed attempts never count.
        assert_eq!(
            derive_payment_status(
                &[
                    sample_payment(1, "20.00", Initiated),
                    sample_payment(2, "20.00", Failed),
                ],
                total
            ),
            PaymentStatus::Unpaid
        );
        assert_eq!(
            derive_payment_status(&[sample_payment(1, "20.00", Refunded)], total),
            PaymentStatus::Refunded
        );
        // A refund alongside remaining settled money is partial, not refunded.
        assert_eq!(
            derive_payment_status(
                &[
                    sample_payment(1, "15.00", Refunded),
                    sample_payment(2, "5.00", Successful),
                ],
                total
            ),
            PaymentStatus::Partial
        );
    }

    #[tokio::test]
    async fn test_settlement_marks_order_paid() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentAttemptStatus::Initiated);
        assert!(payment.provider_payment_id.is_some());
        assert_eq!(payment.currency, CurrencyCode::USD);
        // Acknowledged is not settled.
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Unpaid);

        let settled = fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();
        assert_eq!(settled.status, PaymentAttemptStatus::Successful);
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_partial_payments_accumulate() {
        let fixture = fixture().await;

        let first = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "8.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(first.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Partial);

        let second = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "12.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(second.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_overpayment_rejected_when_recorded() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();

        let err = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "1.00".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            EngineError::Overpayment { attempted, total, .. } => {
                assert_eq!(attempted, "21.00".parse().unwrap());
                assert_eq!(total, "20.00".parse().unwrap());
            }
            other => panic!("expected overpayment, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_raced_settlements_cannot_both_win() {
        let fixture = fixture().await;

        // Both attempts pass the optimistic check while nothing is settled.
        let first = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "15.00".parse().unwrap())
            .await
            .unwrap();
        let second = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "15.00".parse().unwrap())
            .await
            .unwrap();

        fixture
            .coordinator
            .mark_result(first.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();
        let err = fixture
            .coordinator
            .mark_result(second.id, PaymentOutcome::Successful, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Overpayment { .. }));

        // The loser was failed, not left dangling.
        let loser = fixture.coordinator.payment(second.id).await.unwrap().unwrap();
        assert_eq!(loser.status, PaymentAttemptStatus::Failed);
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Partial);
    }

    #[tokio::test]
    async fn test_declined_charge_is_recorded_as_failed() {
        let fixture = fixture().await;
        let declining = coordinator_with(&fixture, DecliningGateway);

        let payment = declining
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentAttemptStatus::Failed);
        assert!(payment.provider_payment_id.is_none());
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_gateway_timeout_leaves_payment_for_the_sweep() {
        let fixture = fixture_with(EngineConfig {
            payment_timeout_minutes: 0,
            ..EngineConfig::default()
        })
        .await;
        let silent = coordinator_with(&fixture, SilentGateway);

        let payment = silent
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentAttemptStatus::Initiated);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = silent.expire_stale().await.unwrap();
        assert_eq!(expired, 1);

        let swept = silent.payment(payment.id).await.unwrap().unwrap();
        assert_eq!(swept.status, PaymentAttemptStatus::Failed);

        // Nothing left to expire.
        assert_eq!(silent.expire_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refund_flips_payment_and_order_standing() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();

        let refunded = fixture.coordinator.refund(payment.id).await.unwrap();
        assert_eq!(refunded.status, PaymentAttemptStatus::Refunded);
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_up_to_prefers_newest_and_may_overshoot() {
        let fixture = fixture().await;

        // 5.00 + 7.00 + 8.00 settled, oldest to newest.
        for amount in ["5.00", "7.00", "8.00"] {
            let payment = fixture
                .coordinator
                .record_attempt(fixture.order.id, "stripe", amount.parse().unwrap())
                .await
                .unwrap();
            fixture
                .coordinator
                .mark_result(payment.id, PaymentOutcome::Successful, None)
                .await
                .unwrap();
        }

        let order = fixture.store.order(fixture.order.id).await.unwrap().unwrap();
        let flipped = fixture
            .coordinator
            .refund_up_to(&order, "10.00".parse().unwrap())
            .await
            .unwrap();
        // Newest (8.00) then next (7.00); the oldest is untouched.
        assert_eq!(flipped, "15.00".parse().unwrap());

        let payments = fixture
            .coordinator
            .payments_for_order(fixture.order.id)
            .await
            .unwrap();
        let statuses: Vec<PaymentAttemptStatus> = payments.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![
                PaymentAttemptStatus::Successful,
                PaymentAttemptStatus::Refunded,
                PaymentAttemptStatus::Refunded,
            ]
        );
        assert_eq!(order_payment_status(&fixture).await, PaymentStatus::Partial);
    }

    #[tokio::test]
    async fn test_refund_up_to_requires_enough_settled() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "5.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();

        let order = fixture.store.order(fixture.order.id).await.unwrap().unwrap();
        let err = fixture
            .coordinator
            .refund_up_to(&order, "6.00".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_mark_result_requires_initiated() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Successful, None)
            .await
            .unwrap();

        let err = fixture
            .coordinator
            .mark_result(payment.id, PaymentOutcome::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                entity: "payment",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refund_requires_successful() {
        let fixture = fixture().await;

        let payment = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "20.00".parse().unwrap())
            .await
            .unwrap();
        let err = fixture.coordinator.refund(payment.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_record_rejects_bad_amounts_and_closed_orders() {
        let fixture = fixture().await;

        let err = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        fixture
            .store
            .set_order_status(
                fixture.order.id,
                OrderStatus::Pending,
                OrderStatus::Cancelled,
            )
            .await
            .unwrap();
        let err = fixture
            .coordinator
            .record_attempt(fixture.order.id, "stripe", "5.00".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let fixture = fixture().await;

        let err = fixture
            .coordinator
            .record_attempt(OrderId::new(999), "stripe", "5.00".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = fixture
            .coordinator
            .mark_result(PaymentId::new(999), PaymentOutcome::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
