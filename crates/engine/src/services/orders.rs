//! Order builder service.
//!
//! Turns a validated cart into a persisted order:
//! 1. Validate the cart, the customer, the addresses, and the charges
//! 2. Snapshot product name, SKU, and unit price into line items
//! 3. Reserve stock for every line, all-or-nothing
//! 4. Insert the order, consuming the reservations in the same atomic unit
//!
//! If anything fails after reservations were taken, every reservation is
//! released before the error is returned; a checkout future dropped
//! mid-flight releases them from a detached task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use stockroom_core::{AddressId, CustomerId, OrderId, ReservationToken};
use tracing::{info, instrument, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{CartLine, CheckoutCharges, LineItem, NewLineItem, NewOrder, Order};
use crate::services::inventory::InventoryLedger;
use crate::store::{Store, StoreError};

/// Order builder service.
pub struct OrderBuilder<S> {
    store: Arc<S>,
    inventory: InventoryLedger<S>,
    activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
}

impl<S> Clone for OrderBuilder<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inventory: self.inventory.clone(),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> OrderBuilder<S> {
    pub(crate) fn new(
        store: Arc<S>,
        inventory: InventoryLedger<S>,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            activity,
            config,
        }
    }

    /// Place an order from a cart.
    ///
    /// Stock for every line is reserved before the order is written, and
    /// the reservations are consumed by the same atomic insert, so a
    /// persisted order always owns its decrements. On any failure after
    /// reservation, all reservations are released and stock is restored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an empty cart, a zero
    /// quantity, a duplicated (product, warehouse) line, negative charges,
    /// an address owned by another customer, or an inactive product;
    /// [`EngineError::NotFound`] if the customer, an address, or a product
    /// does not exist; [`EngineError::InsufficientStock`] if any line
    /// cannot be covered; [`EngineError::Conflict`] if a unique order
    /// number could not be allocated; or [`EngineError::Persistence`] if
    /// the store fails.
    #[instrument(skip(self, cart, charges), fields(customer = %customer_id, lines = cart.len()))]
    pub async fn place_order(
        &self,
        customer_id: CustomerId,
        cart: &[CartLine],
        shipping_address_id: AddressId,
        billing_address_id: AddressId,
        charges: CheckoutCharges,
    ) -> Result<Order, EngineError> {
        if cart.is_empty() {
            return Err(EngineError::validation("cart cannot be empty"));
        }
        let mut seen = HashSet::new();
        for line in cart {
            if line.quantity == 0 {
                return Err(EngineError::validation(format!(
                    "cart line for product {} has zero quantity",
                    line.product_id
                )));
            }
            if !seen.insert((line.product_id, line.warehouse_id)) {
                return Err(EngineError::validation(format!(
                    "duplicate cart line for product {} in warehouse {}",
                    line.product_id, line.warehouse_id
                )));
            }
        }
        if charges.shipping_cost < Decimal::ZERO || charges.tax < Decimal::ZERO {
            return Err(EngineError::validation(
                "shipping cost and tax cannot be negative",
            ));
        }

        if self.store.customer(customer_id).await?.is_none() {
            return Err(EngineError::not_found("customer", customer_id));
        }
        for (label, address_id) in [
            ("shipping", shipping_address_id),
            ("billing", billing_address_id),
        ] {
            let Some(address) = self.store.address(address_id).await? else {
                return Err(EngineError::not_found("address", address_id));
            };
            if address.customer_id != customer_id {
                return Err(EngineError::validation(format!(
                    "{label} address {address_id} does not belong to customer {customer_id}"
                )));
            }
        }

        // Snapshot the catalog state before touching stock, so later
        // price or name edits never leak into this order.
        let mut lines = Vec::with_capacity(cart.len());
        for line in cart {
            let Some(product) = self.store.product(line.product_id).await? else {
                return Err(EngineError::not_found("product", line.product_id));
            };
            if !product.active {
                return Err(EngineError::validation(format!(
                    "product {} is not active",
                    product.sku
                )));
            }
            lines.push(NewLineItem {
                product_id: product.id,
                warehouse_id: line.warehouse_id,
                product_name: product.name,
                sku: product.sku,
                unit_price: product.price,
                quantity: line.quantity,
                line_total: product.price * Decimal::from(line.quantity),
            });
        }

        let mut guard = ReservationGuard::new(self.inventory.clone());
        for line in &lines {
            match self
                .inventory
                .reserve(line.product_id, line.warehouse_id, line.quantity)
                .await
            {
                Ok(token) => guard.push(token),
                Err(e) => {
                    guard.release_all().await;
                    return Err(e);
                }
            }
        }

        let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();
        let total = subtotal + charges.shipping_cost + charges.tax;
        let base = NewOrder {
            order_number: String::new(),
            customer_id,
            shipping_address_id,
            billing_address_id,
            subtotal,
            shipping_cost: charges.shipping_cost,
            tax: charges.tax,
            total,
            currency: charges.currency,
            lines,
        };

        let order = match self.insert_with_retry(base, guard.tokens()).await {
            Ok(order) => order,
            Err(e) => {
                guard.release_all().await;
                return Err(e);
            }
        };
        // The insert consumed the reservations.
        guard.disarm();

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total,
            "Placed order"
        );
        self.activity.record(ActivityEvent::new(
            "order",
            order.id,
            "placed",
            json!({
                "order_number": order.order_number,
                "customer_id": order.customer_id,
                "total": order.total,
                "currency": order.currency,
                "display_total": order.display_total(),
            }),
        ));

        Ok(order)
    }

    /// Fetch an order by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn order(&self, id: OrderId) -> Result<Option<Order>, EngineError> {
        Ok(self.store.order(id).await?)
    }

    /// Fetch an order by its order number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn order_by_number(&self, number: &str) -> Result<Option<Order>, EngineError> {
        Ok(self.store.order_by_number(number).await?)
    }

    /// Fetch an order's line items.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, EngineError> {
        Ok(self.store.line_items(order_id).await?)
    }

    /// Insert the order, regenerating the order number on collisions and
    /// retrying transient store failures, both within configured bounds.
    async fn insert_with_retry(
        &self,
        base: NewOrder,
        tokens: &[ReservationToken],
    ) -> Result<Order, EngineError> {
        let mut number_attempts: u32 = 0;
        let mut insert_attempts: u32 = 0;
        loop {
            let mut attempt = base.clone();
            attempt.order_number = generate_order_number();

            match self.store.insert_order(attempt, tokens).await {
                Ok(order) => return Ok(order),
                Err(StoreError::Conflict(_)) => {
                    number_attempts += 1;
                    if number_attempts >= self.config.order_number_attempts {
                        return Err(EngineError::conflict(
                            "could not allocate a unique order number",
                        ));
                    }
                }
                Err(e) if is_transient(&e) && insert_attempts < self.config.insert_retry_attempts => {
                    insert_attempts += 1;
                    warn!(error = %e, attempt = insert_attempts, "Retrying order insert");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.stock_retry_backoff_ms * u64::from(insert_attempts),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// `SR-YYYYMMDD-NNNNNN`, random suffix. Collisions are handled by
/// regeneration at insert time.
fn generate_order_number() -> String {
    let suffix: u32 = rand::rng().random_range(0..1_000_000);
    format!("SR-{}-{suffix:06}", Utc::now().format("%Y%m%d"))
}

/// Connection-level failures surface as `Database` errors; constraint
/// breaks come back as `Conflict` or `DataCorruption` and are not
/// retryable.
fn is_transient(error: &StoreError) -> bool {
    #[cfg(feature = "postgres")]
    {
        matches!(error, StoreError::Database(_))
    }
    #[cfg(not(feature = "postgres"))]
    {
        let _ = error;
        false
    }
}

/// Holds freshly issued reservation tokens until the order insert settles
/// them, releasing them if checkout unwinds instead.
struct ReservationGuard<S: Store> {
    ledger: InventoryLedger<S>,
    tokens: Vec<ReservationToken>,
    armed: bool,
}

impl<S: Store> ReservationGuard<S> {
    fn new(ledger: InventoryLedger<S>) -> Self {
        Self {
            ledger,
            tokens: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, token: ReservationToken) {
        self.tokens.push(token);
    }

    fn tokens(&self) -> &[ReservationToken] {
        &self.tokens
    }

    /// The insert consumed the tokens; nothing left to release.
    fn disarm(mut self) {
        self.armed = false;
        self.tokens.clear();
    }

    /// Release every held reservation now, on the caller's task.
    async fn release_all(mut self) {
        self.armed = false;
        for token in std::mem::take(&mut self.tokens) {
            if let Err(e) = self.ledger.release(token).await {
                warn!(error = %e, token = %token, "Failed to release reservation during checkout unwind");
            }
        }
    }
}

impl<S: Store> Drop for ReservationGuard<S> {
    fn drop(&mut self) {
        if !self.armed || self.tokens.is_empty() {
            return;
        }
        // The checkout future was dropped mid-flight. Hand the release to
        // the runtime if one is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let ledger = self.ledger.clone();
            let tokens = std::mem::take(&mut self.tokens);
            handle.spawn(async move {
                for token in tokens {
                    if let Err(e) = ledger.release(token).await {
                        warn!(error = %e, token = %token, "Failed to release reservation after cancelled checkout");
                    }
                }
            });
        } else {
            warn!(
                count = self.tokens.len(),
                "Reservations not released: no async runtime available"
            );
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
    use crate::models::{Customer, NewAddress, NewCustomer, NewProduct, Product};
    use crate::store::MemoryStore;
    use stockroom_core::{CurrencyCode, OrderStatus, PaymentStatus, ProductId, WarehouseId};

    const WAREHOUSE: WarehouseId = WarehouseId::new(1);

    struct Fixture {
        store: Arc<MemoryStore>,
        inventory: InventoryLedger<MemoryStore>,
        builder: OrderBuilder<MemoryStore>,
        customer: Customer,
        address_id: AddressId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let activity: Arc<dyn ActivityLog> = Arc::new(MemoryActivityLog::new());
        let config = EngineConfig::default();
        let inventory = InventoryLedger::new(
            Arc::clone(&store),
            Arc::clone(&activity),
            config.clone(),
        );
        let builder = OrderBuilder::new(
            Arc::clone(&store),
            inventory.clone(),
            Arc::clone(&activity),
            config,
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

        Fixture {
            store,
            inventory,
            builder,
            customer,
            address_id: address.id,
        }
    }

    async fn add_product(fixture: &Fixture, sku: &str, price: &str, stock: u32) -> Product {
        let product = fixture
            .store
            .insert_product(NewProduct {
                sku: sku.parse().unwrap(),
                name: format!("Product {sku}"),
                description: None,
                price: price.parse().unwrap(),
                category_id: None,
                active: true,
                images: Vec::new(),
                suppliers: Vec::new(),
                tags: Vec::new(),
            })
            .await
            .unwrap();
        if stock > 0 {
            fixture
                .inventory
                .restock(product.id, WAREHOUSE, stock)
                .await
                .unwrap();
        }
        product
    }

    fn charges() -> CheckoutCharges {
        CheckoutCharges {
            shipping_cost: "3.00".parse().unwrap(),
            tax: "1.50".parse().unwrap(),
            currency: CurrencyCode::USD,
        }
    }

    fn line(product: &Product, quantity: u32) -> CartLine {
        CartLine {
            product_id: product.id,
            warehouse_id: WAREHOUSE,
            quantity,
        }
    }

    async fn stock_of(fixture: &Fixture, product: &Product) -> i64 {
        fixture
            .inventory
            .stock_level(product.id, WAREHOUSE)
            .await
            .unwrap()
            .map_or(0, |level| level.quantity)
    }

    #[tokio::test]
    async fn test_place_order_totals_and_snapshots() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;
        let gadget = add_product(&fixture, "GADGET-01", "5.50", 10).await;

        let order = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 2), line(&gadget, 1)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap();

        assert_eq!(order.subtotal, "25.50".parse().unwrap());
        assert_eq!(order.total, "30.00".parse().unwrap());
        assert_eq!(order.display_total(), "$30.00");
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Unpaid);
        assert!(order.order_number.starts_with("SR-"));

        let items = fixture.builder.line_items(order.id).await.unwrap();
        assert_eq!(items.len(), 2);
        let widget_line = items.iter().find(|i| i.product_id == widget.id).unwrap();
        assert_eq!(widget_line.product_name, "Product WIDGET-01");
        assert_eq!(widget_line.unit_price, "10.00".parse().unwrap());
        assert_eq!(widget_line.line_total, "20.00".parse().unwrap());

        assert_eq!(stock_of(&fixture, &widget).await, 8);
        assert_eq!(stock_of(&fixture, &gadget).await, 9);

        let by_number = fixture
            .builder
            .order_by_number(&order.order_number)
            .await
            .unwrap();
        assert_eq!(by_number.unwrap().id, order.id);
    }

    #[tokio::test]
    async fn test_snapshot_survives_catalog_edits() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;

        let order = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 1)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap();

        // Deactivate after purchase; history must be untouched.
        fixture
            .store
            .set_product_active(widget.id, false)
            .await
            .unwrap();

        let items = fixture.builder.line_items(order.id).await.unwrap();
        let item = items.first().unwrap();
        assert_eq!(item.unit_price, "10.00".parse().unwrap());
        assert_eq!(item.sku.as_str(), "WIDGET-01");
    }

    #[tokio::test]
    async fn test_empty_cart_is_rejected() {
        let fixture = fixture().await;
        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_zero_quantity_and_duplicate_lines_are_rejected() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;

        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 0)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 1), line(&widget, 2)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_negative_charges_are_rejected() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;

        let mut bad = charges();
        bad.tax = "-0.01".parse().unwrap();
        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 1)],
                fixture.address_id,
                fixture.address_id,
                bad,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_customer_and_foreign_address() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;

        let err = fixture
            .builder
            .place_order(
                CustomerId::new(999),
                &[line(&widget, 1)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        // An address belonging to someone else is a validation failure,
        // not a missing entity.
        let other = fixture
            .store
            .insert_customer(NewCustomer {
                email: "other@example.com".parse().unwrap(),
                name: "Other".to_string(),
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap();
        let foreign = fixture
            .store
            .insert_address(NewAddress {
                customer_id: other.id,
                line1: "9 Elm St".to_string(),
                line2: None,
                city: "Shelbyville".to_string(),
                region: None,
                postal_code: "62705".to_string(),
                country: "US".to_string(),
            })
            .await
            .unwrap();

        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 1)],
                foreign.id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_inactive_product_is_rejected_before_reserving() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;
        fixture
            .store
            .set_product_active(widget.id, false)
            .await
            .unwrap();

        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 1)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(stock_of(&fixture, &widget).await, 10);
    }

    #[tokio::test]
    async fn test_unknown_product_is_not_found() {
        let fixture = fixture().await;
        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[CartLine {
                    product_id: ProductId::new(999),
                    warehouse_id: WAREHOUSE,
                    quantity: 1,
                }],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reservation_is_all_or_nothing() {
        let fixture = fixture().await;
        let widget = add_product(&fixture, "WIDGET-01", "10.00", 10).await;
        let scarce = add_product(&fixture, "SCARCE-01", "4.00", 1).await;

        let err = fixture
            .builder
            .place_order(
                fixture.customer.id,
                &[line(&widget, 2), line(&scarce, 3)],
                fixture.address_id,
                fixture.address_id,
                charges(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientStock { .. }));

        // The widget reservation must have been rolled back.
        assert_eq!(stock_of(&fixture, &widget).await, 10);
        assert_eq!(stock_of(&fixture, &scarce).await, 1);
    }

    #[test]
    fn test_order_number_shape() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.first().copied(), Some("SR"));
        assert_eq!(parts.get(1).map(|s| s.len()), Some(8));
        assert_eq!(parts.get(2).map(|s| s.len()), Some(6));
    }
}
