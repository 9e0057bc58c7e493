//! In-memory [`Store`] backend.
//!
//! Backs the default engine and the test suites. One `RwLock` guards all
//! tables, which makes every method a single critical section and gives
//! the conditional updates their required atomicity for free.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stockroom_core::{
    AddressId, CategoryId, CustomerId, Email, LineItemId, OrderId, OrderStatus,
    PaymentAttemptStatus, PaymentId, PaymentStatus, ProductId, ReservationToken, ReturnId,
    ReturnStatus, ReviewId, Sku, WarehouseId,
};
use tokio::sync::RwLock;

use crate::models::{
    Address, Category, Customer, CustomerProfile, LineItem, NewAddress, NewCategory, NewCustomer,
    NewOrder, NewPayment, NewProduct, NewReturn, NewReview, Order, Payment, Product, Reservation,
    ReturnRequest, Review, StockLevel,
};
use crate::store::{StockAdjustment, Store, StoreError};

#[derive(Default)]
struct State {
    seq: i32,
    customers: HashMap<CustomerId, Customer>,
    profiles: HashMap<CustomerId, CustomerProfile>,
    addresses: HashMap<AddressId, Address>,
    products: HashMap<ProductId, Product>,
    categories: HashMap<CategoryId, Category>,
    reviews: HashMap<ReviewId, Review>,
    stock: HashMap<(ProductId, WarehouseId), i64>,
    reservations: HashMap<ReservationToken, Reservation>,
    orders: HashMap<OrderId, Order>,
    order_numbers: HashMap<String, OrderId>,
    line_items: HashMap<OrderId, Vec<LineItem>>,
    payments: HashMap<PaymentId, Payment>,
    returns: HashMap<ReturnId, ReturnRequest>,
}

impl State {
    fn next_id(&mut self) -> i32 {
        self.seq += 1;
        self.seq
    }
}

/// In-memory store. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    // =========================================================================
    // Customers
    // =========================================================================

    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, StoreError> {
        let mut state = self.state.write().await;
        if state.customers.values().any(|c| c.email == new.email) {
            return Err(StoreError::Conflict(format!(
                "email {} already registered",
                new.email
            )));
        }
        let customer = Customer {
            id: CustomerId::new(state.next_id()),
            email: new.email,
            name: new.name,
            password_hash: new.password_hash,
            created_at: Utc::now(),
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn customer(&self, id: CustomerId) -> Result<Option<Customer>, StoreError> {
        Ok(self.state.read().await.customers.get(&id).cloned())
    }

    async fn customer_by_email(&self, email: &Email) -> Result<Option<Customer>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .find(|c| &c.email == email)
            .cloned())
    }

    async fn upsert_profile(&self, profile: CustomerProfile) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.profiles.insert(profile.customer_id, profile);
        Ok(())
    }

    async fn profile(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerProfile>, StoreError> {
        Ok(self.state.read().await.profiles.get(&customer_id).cloned())
    }

    async fn insert_address(&self, new: NewAddress) -> Result<Address, StoreError> {
        let mut state = self.state.write().await;
        let address = Address {
            id: AddressId::new(state.next_id()),
            customer_id: new.customer_id,
            line1: new.line1,
            line2: new.line2,
            city: new.city,
            region: new.region,
            postal_code: new.postal_code,
            country: new.country,
        };
        state.addresses.insert(address.id, address.clone());
        Ok(address)
    }

    async fn address(&self, id: AddressId) -> Result<Option<Address>, StoreError> {
        Ok(self.state.read().await.addresses.get(&id).cloned())
    }

    async fn addresses_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Address>, StoreError> {
        let state = self.state.read().await;
        let mut addresses: Vec<Address> = state
            .addresses
            .values()
            .filter(|a| a.customer_id == customer_id)
            .cloned()
            .collect();
        addresses.sort_by_key(|a| a.id);
        Ok(addresses)
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    async fn insert_product(&self, new: NewProduct) -> Result<Product, StoreError> {
        let mut state = self.state.write().await;
        if state.products.values().any(|p| p.sku == new.sku) {
            return Err(StoreError::Conflict(format!(
                "sku {} already registered",
                new.sku
            )));
        }
        let product = Product {
            id: ProductId::new(state.next_id()),
            sku: new.sku,
            name: new.name,
            description: new.description,
            price: new.price,
            category_id: new.category_id,
            active: new.active,
            images: new.images,
            suppliers: new.suppliers,
            tags: new.tags,
            created_at: Utc::now(),
        };
        state.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.state.read().await.products.get(&id).cloned())
    }

    async fn product_by_sku(&self, sku: &Sku) -> Result<Option<Product>, StoreError> {
        let state = self.state.read().await;
        Ok(state.products.values().find(|p| &p.sku == sku).cloned())
    }

    async fn set_product_active(&self, id: ProductId, active: bool) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.products.get_mut(&id) {
            Some(product) => {
                product.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_product_category(
        &self,
        id: ProductId,
        category_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.products.get_mut(&id) {
            Some(product) => {
                product.category_id = category_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_category(&self, new: NewCategory) -> Result<Category, StoreError> {
        let mut state = self.state.write().await;
        let category = Category {
            id: CategoryId::new(state.next_id()),
            name: new.name,
            parent_id: new.parent_id,
        };
        state.categories.insert(category.id, category.clone());
        Ok(category)
    }

    async fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError> {
        Ok(self.state.read().await.categories.get(&id).cloned())
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        let state = self.state.read().await;
        let mut categories: Vec<Category> = state.categories.values().cloned().collect();
        categories.sort_by_key(|c| c.id);
        Ok(categories)
    }

    async fn set_category_parent(
        &self,
        id: CategoryId,
        parent_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.categories.get_mut(&id) {
            Some(category) => {
                category.parent_id = parent_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, StoreError> {
        let mut state = self.state.write().await;
        let review = Review {
            id: ReviewId::new(state.next_id()),
            product_id: new.product_id,
            customer_id: new.customer_id,
            rating: new.rating,
            body: new.body,
            created_at: Utc::now(),
        };
        state.reviews.insert(review.id, review.clone());
        Ok(review)
    }

    async fn reviews_for_product(&self, product_id: ProductId) -> Result<Vec<Review>, StoreError> {
        let state = self.state.read().await;
        let mut reviews: Vec<Review> = state
            .reviews
            .values()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect();
        reviews.sort_by_key(|r| r.id);
        Ok(reviews)
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    async fn stock_level(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<StockLevel>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .stock
            .get(&(product_id, warehouse_id))
            .map(|&quantity| StockLevel {
                product_id,
                warehouse_id,
                quantity,
            }))
    }

    async fn adjust_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        delta: i64,
    ) -> Result<StockAdjustment, StoreError> {
        let mut state = self.state.write().await;
        match state.stock.get_mut(&(product_id, warehouse_id)) {
            Some(quantity) => {
                let next = *quantity + delta;
                if next < 0 {
                    Ok(StockAdjustment::Insufficient {
                        available: *quantity,
                    })
                } else {
                    *quantity = next;
                    Ok(StockAdjustment::Applied { quantity: next })
                }
            }
            None if delta > 0 => {
                state.stock.insert((product_id, warehouse_id), delta);
                Ok(StockAdjustment::Applied { quantity: delta })
            }
            None => Ok(StockAdjustment::Insufficient { available: 0 }),
        }
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.reservations.contains_key(&reservation.token) {
            return Err(StoreError::Conflict(format!(
                "reservation token {} already exists",
                reservation.token
            )));
        }
        state.reservations.insert(reservation.token, reservation);
        Ok(())
    }

    async fn take_reservation(
        &self,
        token: ReservationToken,
    ) -> Result<Option<Reservation>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.reservations.remove(&token))
    }

    // =========================================================================
    // Orders
    // =========================================================================

    async fn insert_order(
        &self,
        new: NewOrder,
        tokens: &[ReservationToken],
    ) -> Result<Order, StoreError> {
        let mut state = self.state.write().await;
        for token in tokens {
            if !state.reservations.contains_key(token) {
                return Err(StoreError::DataCorruption(format!(
                    "reservation {token} missing at order insert"
                )));
            }
        }
        if state.order_numbers.contains_key(&new.order_number) {
            return Err(StoreError::Conflict(format!(
                "order number {} already exists",
                new.order_number
            )));
        }
        for token in tokens {
            state.reservations.remove(token);
        }
        let order = Order {
            id: OrderId::new(state.next_id()),
            order_number: new.order_number,
            customer_id: new.customer_id,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            shipping_address_id: new.shipping_address_id,
            billing_address_id: new.billing_address_id,
            subtotal: new.subtotal,
            shipping_cost: new.shipping_cost,
            tax: new.tax,
            total: new.total,
            currency: new.currency,
            placed_at: Utc::now(),
        };
        let lines: Vec<LineItem> = new
            .lines
            .into_iter()
            .map(|line| LineItem {
                id: LineItemId::new(state.next_id()),
                order_id: order.id,
                product_id: line.product_id,
                warehouse_id: line.warehouse_id,
                product_name: line.product_name,
                sku: line.sku,
                unit_price: line.unit_price,
                quantity: line.quantity,
                line_total: line.line_total,
            })
            .collect();
        state
            .order_numbers
            .insert(order.order_number.clone(), order.id);
        state.line_items.insert(order.id, lines);
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order_numbers
            .get(number)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
        let state = self.state.read().await;
        Ok(state.line_items.get(&order_id).cloned().unwrap_or_default())
    }

    async fn set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.orders.get_mut(&id) {
            Some(order) if order.status == from => {
                order.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_payment_status(
        &self,
        id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.orders.get_mut(&id) {
            Some(order) => {
                order.payment_status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Payments
    // =========================================================================

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError> {
        let mut state = self.state.write().await;
        let payment = Payment {
            id: PaymentId::new(state.next_id()),
            order_id: new.order_id,
            provider: new.provider,
            provider_payment_id: None,
            amount: new.amount,
            currency: new.currency,
            status: PaymentAttemptStatus::Initiated,
            created_at: Utc::now(),
        };
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    async fn set_payment_attempt_status(
        &self,
        id: PaymentId,
        from: PaymentAttemptStatus,
        to: PaymentAttemptStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == from => {
                payment.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_provider_payment_id(
        &self,
        id: PaymentId,
        provider_payment_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&id) {
            Some(payment) => {
                payment.provider_payment_id = Some(provider_payment_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn initiated_payments_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentAttemptStatus::Initiated && p.created_at < cutoff)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    // =========================================================================
    // Returns
    // =========================================================================

    async fn insert_return(&self, new: NewReturn) -> Result<ReturnRequest, StoreError> {
        let mut state = self.state.write().await;
        let request = ReturnRequest {
            id: ReturnId::new(state.next_id()),
            order_id: new.order_id,
            status: ReturnStatus::Requested,
            reason: new.reason,
            lines: new.lines,
            refund_amount: None,
            requested_at: Utc::now(),
        };
        state.returns.insert(request.id, request.clone());
        Ok(request)
    }

    async fn return_request(&self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError> {
        Ok(self.state.read().await.returns.get(&id).cloned())
    }

    async fn returns_for_order(&self, order_id: OrderId) -> Result<Vec<ReturnRequest>, StoreError> {
        let state = self.state.read().await;
        let mut returns: Vec<ReturnRequest> = state
            .returns
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        returns.sort_by_key(|r| r.id);
        Ok(returns)
    }

    async fn set_return_status(
        &self,
        id: ReturnId,
        from: ReturnStatus,
        to: ReturnStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.returns.get_mut(&id) {
            Some(request) if request.status == from => {
                request.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_return(
        &self,
        id: ReturnId,
        refund_amount: Decimal,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.returns.get_mut(&id) {
            Some(request) if request.status == ReturnStatus::Approved => {
                request.status = ReturnStatus::Completed;
                request.refund_amount = Some(refund_amount);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
