//! Integration test support for Stockroom.
//!
//! The tests in `tests/` drive a full [`Engine`] over the in-memory
//! store through its public services only, the way an embedding
//! application would.
//!
//! # Test Categories
//!
//! - `checkout_flow` - cart to delivered order, end to end
//! - `returns_flow` - returns, refunds, and the refund status policy
//! - `stock_consistency` - concurrent reservations and restocking
//! - `checkout_compensation` - reservation rollback on insert failure
//!
//! Helpers here panic on seeding failures; they only run inside tests.

#![cfg_attr(not(test), forbid(unsafe_code))]
#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stockroom_core::{
    AddressId, CategoryId, CurrencyCode, CustomerId, Email, OrderId, OrderStatus,
    PaymentAttemptStatus, PaymentId, PaymentStatus, ProductId, ReservationToken, ReturnId,
    ReturnStatus, Sku, WarehouseId,
};
use stockroom_engine::activity::{ActivityLog, MemoryActivityLog};
use stockroom_engine::config::EngineConfig;
use stockroom_engine::engine::Engine;
use stockroom_engine::gateway::{PaymentGateway, StaticGateway};
use stockroom_engine::models::{
    Address, CartLine, Category, CheckoutCharges, Customer, CustomerProfile, LineItem, NewAddress,
    NewCategory, NewCustomer, NewOrder, NewPayment, NewProduct, NewReturn, NewReview, Order,
    Payment, PaymentOutcome, Product, Reservation, ReturnRequest, Review, StockLevel,
};
use stockroom_engine::store::{MemoryStore, StockAdjustment, Store, StoreError};

/// The warehouse every fixture ships from.
pub const WAREHOUSE: WarehouseId = WarehouseId::new(1);

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
///
/// Later calls are no-ops, so every test can call it unconditionally.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Zero shipping and tax in USD, to keep expected totals readable.
#[must_use]
pub fn no_charges() -> CheckoutCharges {
    CheckoutCharges {
        shipping_cost: Decimal::ZERO,
        tax: Decimal::ZERO,
        currency: CurrencyCode::USD,
    }
}

/// The entities every test starts from: one customer with an address and
/// one 10.00 product with 10 units on hand.
pub struct Seeded {
    pub customer: Customer,
    pub address: Address,
    pub product: Product,
}

/// Seed the standard catalog through the engine's public services.
pub async fn seed_catalog<S: Store, G: PaymentGateway>(engine: &Engine<S, G>) -> Seeded {
    let customer = engine
        .customers()
        .register(NewCustomer {
            email: "buyer@example.com".parse().unwrap(),
            name: "Buyer".to_string(),
            password_hash: "hash".to_string(),
        })
        .await
        .unwrap();
    let address = engine
        .customers()
        .add_address(NewAddress {
            customer_id: customer.id,
            line1: "1 Main St".to_string(),
            line2: None,
            city: "Springfield".to_string(),
            region: Some("OR".to_string()),
            postal_code: "97477".to_string(),
            country: "US".to_string(),
        })
        .await
        .unwrap();
    let product = engine
        .catalog()
        .register_product(NewProduct {
            sku: "WIDGET-01".parse().unwrap(),
            name: "Widget".to_string(),
            description: Some("A widget".to_string()),
            price: "10.00".parse().unwrap(),
            category_id: None,
            active: true,
            images: Vec::new(),
            suppliers: Vec::new(),
            tags: Vec::new(),
        })
        .await
        .unwrap();
    engine
        .inventory()
        .restock(product.id, WAREHOUSE, 10)
        .await
        .unwrap();

    Seeded {
        customer,
        address,
        product,
    }
}

/// Place an order for `quantity` units of the seeded product.
pub async fn place<S: Store, G: PaymentGateway>(
    engine: &Engine<S, G>,
    seeded: &Seeded,
    quantity: u32,
) -> Order {
    engine
        .orders()
        .place_order(
            seeded.customer.id,
            &[CartLine {
                product_id: seeded.product.id,
                warehouse_id: WAREHOUSE,
                quantity,
            }],
            seeded.address.id,
            seeded.address.id,
            no_charges(),
        )
        .await
        .unwrap()
}

/// Record and settle a payment of `amount` against the order.
pub async fn settle<S: Store, G: PaymentGateway>(
    engine: &Engine<S, G>,
    order: &Order,
    amount: &str,
) -> Payment {
    let payment = engine
        .payments()
        .record_attempt(order.id, "stripe", amount.parse().unwrap())
        .await
        .unwrap();
    engine
        .payments()
        .mark_result(payment.id, PaymentOutcome::Successful, None)
        .await
        .unwrap()
}

/// Walk an order from pending to delivered.
pub async fn deliver<S: Store, G: PaymentGateway>(engine: &Engine<S, G>, order_id: OrderId) {
    for status in [
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ] {
        engine.lifecycle().transition(order_id, status).await.unwrap();
    }
}

/// On-hand units of a product at the fixture warehouse; zero if the row
/// does not exist.
pub async fn on_hand<S: Store, G: PaymentGateway>(
    engine: &Engine<S, G>,
    product_id: ProductId,
) -> i64 {
    engine
        .inventory()
        .stock_level(product_id, WAREHOUSE)
        .await
        .unwrap()
        .map_or(0, |level| level.quantity)
}

/// A fully seeded engine over the in-memory store, with the activity
/// sink held open for inspection.
pub struct TestContext {
    pub engine: Engine<MemoryStore, StaticGateway>,
    pub activity: Arc<MemoryActivityLog>,
    pub seeded: Seeded,
}

impl TestContext {
    /// A context with default configuration.
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    /// A context with the given configuration.
    pub async fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let activity = Arc::new(MemoryActivityLog::new());
        let sink: Arc<dyn ActivityLog> = activity.clone();
        let engine = Engine::new(MemoryStore::new(), StaticGateway::new(), sink, config);
        let seeded = seed_catalog(&engine).await;
        Self {
            engine,
            activity,
            seeded,
        }
    }
}

// =============================================================================
// Failure-injecting store
// =============================================================================

/// A [`MemoryStore`] wrapper that injects failures, for exercising
/// checkout compensation and retry paths.
///
/// Clones share both the underlying state and the failure counters, so a
/// test can keep a handle while the engine owns another.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_order_inserts: Arc<AtomicU32>,
    failing_stock_adjustments: Arc<AtomicU32>,
}

impl FlakyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `insert_order`.
    pub fn fail_next_order_inserts(&self, count: u32) {
        self.failing_order_inserts.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `adjust_stock` with a conflict, as
    /// if a concurrent writer kept winning.
    pub fn fail_next_stock_adjustments(&self, count: u32) {
        self.failing_stock_adjustments.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Store for FlakyStore {
    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, StoreError> {
        self.inner.insert_customer(new).await
    }

    async fn customer(&self, id: CustomerId) -> Result<Option<Customer>, StoreError> {
        self.inner.customer(id).await
    }

    async fn customer_by_email(&self, email: &Email) -> Result<Option<Customer>, StoreError> {
        self.inner.customer_by_email(email).await
    }

    async fn upsert_profile(&self, profile: CustomerProfile) -> Result<(), StoreError> {
        self.inner.upsert_profile(profile).await
    }

    async fn profile(&self, customer_id: CustomerId) -> Result<Option<CustomerProfile>, StoreError> {
        self.inner.profile(customer_id).await
    }

    async fn insert_address(&self, new: NewAddress) -> Result<Address, StoreError> {
        self.inner.insert_address(new).await
    }

    async fn address(&self, id: AddressId) -> Result<Option<Address>, StoreError> {
        self.inner.address(id).await
    }

    async fn addresses_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Address>, StoreError> {
        self.inner.addresses_for_customer(customer_id).await
    }

    async fn insert_product(&self, new: NewProduct) -> Result<Product, StoreError> {
        self.inner.insert_product(new).await
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        self.inner.product(id).await
    }

    async fn product_by_sku(&self, sku: &Sku) -> Result<Option<Product>, StoreError> {
        self.inner.product_by_sku(sku).await
    }

    async fn set_product_active(&self, id: ProductId, active: bool) -> Result<bool, StoreError> {
        self.inner.set_product_active(id, active).await
    }

    async fn set_product_category(
        &self,
        id: ProductId,
        category_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        self.inner.set_product_category(id, category_id).await
    }

    async fn insert_category(&self, new: NewCategory) -> Result<Category, StoreError> {
        self.inner.insert_category(new).await
    }

    async fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError> {
        self.inner.category(id).await
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        self.inner.categories().await
    }

    async fn set_category_parent(
        &self,
        id: CategoryId,
        parent_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        self.inner.set_category_parent(id, parent_id).await
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, StoreError> {
        self.inner.insert_review(new).await
    }

    async fn reviews_for_product(&self, product_id: ProductId) -> Result<Vec<Review>, StoreError> {
        self.inner.reviews_for_product(product_id).await
    }

    async fn stock_level(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<StockLevel>, StoreError> {
        self.inner.stock_level(product_id, warehouse_id).await
    }

    async fn adjust_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        delta: i64,
    ) -> Result<StockAdjustment, StoreError> {
        if Self::take_failure(&self.failing_stock_adjustments) {
            return Err(StoreError::Conflict(
                "synthetic stock contention".to_string(),
            ));
        }
        self.inner.adjust_stock(product_id, warehouse_id, delta).await
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.inner.insert_reservation(reservation).await
    }

    async fn take_reservation(
        &self,
        token: ReservationToken,
    ) -> Result<Option<Reservation>, StoreError> {
        self.inner.take_reservation(token).await
    }

    async fn insert_order(
        &self,
        new: NewOrder,
        tokens: &[ReservationToken],
    ) -> Result<Order, StoreError> {
        if Self::take_failure(&self.failing_order_inserts) {
            return Err(StoreError::DataCorruption(
                "synthetic order insert failure".to_string(),
            ));
        }
        self.inner.insert_order(new, tokens).await
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.inner.order(id).await
    }

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        self.inner.order_by_number(number).await
    }

    async fn line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
        self.inner.line_items(order_id).await
    }

    async fn set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError> {
        self.inner.set_order_status(id, from, to).await
    }

    async fn set_payment_status(
        &self,
        id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool, StoreError> {
        self.inner.set_payment_status(id, status).await
    }

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError> {
        self.inner.insert_payment(new).await
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        self.inner.payment(id).await
    }

    async fn payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>, StoreError> {
        self.inner.payments_for_order(order_id).await
    }

    async fn set_payment_attempt_status(
        &self,
        id: PaymentId,
        from: PaymentAttemptStatus,
        to: PaymentAttemptStatus,
    ) -> Result<bool, StoreError> {
        self.inner.set_payment_attempt_status(id, from, to).await
    }

    async fn set_provider_payment_id(
        &self,
        id: PaymentId,
        provider_payment_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner.set_provider_payment_id(id, provider_payment_id).await
    }

    async fn initiated_payments_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, StoreError> {
        self.inner.initiated_payments_before(cutoff).await
    }

    async fn insert_return(&self, new: NewReturn) -> Result<ReturnRequest, StoreError> {
        self.inner.insert_return(new).await
    }

    async fn return_request(&self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError> {
        self.inner.return_request(id).await
    }

    async fn returns_for_order(&self, order_id: OrderId) -> Result<Vec<ReturnRequest>, StoreError> {
        self.inner.returns_for_order(order_id).await
    }

    async fn set_return_status(
        &self,
        id: ReturnId,
        from: ReturnStatus,
        to: ReturnStatus,
    ) -> Result<bool, StoreError> {
        self.inner.set_return_status(id, from, to).await
    }

    async fn complete_return(&self, id: ReturnId, refund_amount: Decimal) -> Result<bool, StoreError> {
        self.inner.complete_return(id, refund_amount).await
    }
}
