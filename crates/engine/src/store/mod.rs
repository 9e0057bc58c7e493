//! Persistence collaborator.
//!
//! The engine issues atomic read-modify-write operations against a
//! [`Store`]. Two backends ship: [`MemoryStore`] (default, used by the
//! test suites and for embedding) and `PgStore` behind the `postgres`
//! feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::future::Future;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stockroom_core::{
    AddressId, CategoryId, CustomerId, Email, OrderId, OrderStatus, PaymentAttemptStatus,
    PaymentId, PaymentStatus, ProductId, ReservationToken, ReturnId, ReturnStatus, Sku,
    WarehouseId,
};
use thiserror::Error;

use crate::models::{
    Address, Category, Customer, CustomerProfile, LineItem, NewAddress, NewCategory, NewCustomer,
    NewOrder, NewPayment, NewProduct, NewReturn, NewReview, Order, Payment, Product, Reservation,
    ReturnRequest, Review, StockLevel,
};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sqlx.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the store is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., unique email or order number).
    #[error("constraint violation: {0}")]
    Conflict(String),
}

/// The result of an atomic conditional stock adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockAdjustment {
    /// The adjustment applied; `quantity` is the new on-hand count.
    Applied {
        /// Units on hand after the adjustment.
        quantity: i64,
    },
    /// A negative adjustment would have driven the row below zero and was
    /// not applied. A missing row reports zero available.
    Insufficient {
        /// Units on hand when the adjustment was evaluated.
        available: i64,
    },
}

/// The engine's persistence collaborator.
///
/// Required guarantees: read-committed or stronger isolation, and the
/// single-row conditional updates (`adjust_stock`, the `set_*` CAS
/// methods) must be atomic. `insert_order` and `insert_return` are the
/// only compound operations; backends run them in one transaction.
///
/// Referential validation (customer exists, product active, address
/// ownership) happens in the services; stores enforce only uniqueness and
/// the conditional updates.
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Customers
    // =========================================================================

    /// Insert a customer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the email is already registered,
    /// or another `StoreError` if the insert fails.
    fn insert_customer(
        &self,
        new: NewCustomer,
    ) -> impl Future<Output = Result<Customer, StoreError>> + Send;

    /// Fetch a customer by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn customer(
        &self,
        id: CustomerId,
    ) -> impl Future<Output = Result<Option<Customer>, StoreError>> + Send;

    /// Fetch a customer by (lowercased) email.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn customer_by_email(
        &self,
        email: &Email,
    ) -> impl Future<Output = Result<Option<Customer>, StoreError>> + Send;

    /// Insert or replace a customer's profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert_profile(
        &self,
        profile: CustomerProfile,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetch a customer's profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn profile(
        &self,
        customer_id: CustomerId,
    ) -> impl Future<Output = Result<Option<CustomerProfile>, StoreError>> + Send;

    /// Insert an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_address(
        &self,
        new: NewAddress,
    ) -> impl Future<Output = Result<Address, StoreError>> + Send;

    /// Fetch an address by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn address(
        &self,
        id: AddressId,
    ) -> impl Future<Output = Result<Option<Address>, StoreError>> + Send;

    /// Fetch all of a customer's addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn addresses_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> impl Future<Output = Result<Vec<Address>, StoreError>> + Send;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Insert a product.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the SKU is already registered,
    /// or another `StoreError` if the insert fails.
    fn insert_product(
        &self,
        new: NewProduct,
    ) -> impl Future<Output = Result<Product, StoreError>> + Send;

    /// Fetch a product by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn product(
        &self,
        id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send;

    /// Fetch a product by SKU.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn product_by_sku(
        &self,
        sku: &Sku,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send;

    /// Set a product's active flag. Returns false if the product does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_product_active(
        &self,
        id: ProductId,
        active: bool,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Move a product to a category (or out of any, with `None`). Returns
    /// false if the product does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_product_category(
        &self,
        id: ProductId,
        category_id: Option<CategoryId>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Insert a category.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_category(
        &self,
        new: NewCategory,
    ) -> impl Future<Output = Result<Category, StoreError>> + Send;

    /// Fetch a category by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn category(
        &self,
        id: CategoryId,
    ) -> impl Future<Output = Result<Option<Category>, StoreError>> + Send;

    /// Fetch every category.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn categories(&self) -> impl Future<Output = Result<Vec<Category>, StoreError>> + Send;

    /// Re-parent a category. Returns false if the category does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_category_parent(
        &self,
        id: CategoryId,
        parent_id: Option<CategoryId>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Insert a review.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_review(
        &self,
        new: NewReview,
    ) -> impl Future<Output = Result<Review, StoreError>> + Send;

    /// Fetch a product's reviews.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn reviews_for_product(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Vec<Review>, StoreError>> + Send;

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Fetch the stock row for one (product, warehouse) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn stock_level(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> impl Future<Output = Result<Option<StockLevel>, StoreError>> + Send;

    /// Atomically adjust a stock row by `delta`, refusing adjustments that
    /// would take it below zero. A positive adjustment creates the row if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails. Insufficient stock is not an
    /// error; it is reported via [`StockAdjustment::Insufficient`].
    fn adjust_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        delta: i64,
    ) -> impl Future<Output = Result<StockAdjustment, StoreError>> + Send;

    /// Persist a reservation record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on a token collision, or another
    /// `StoreError` if the insert fails.
    fn insert_reservation(
        &self,
        reservation: Reservation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically remove and return a reservation record. Returns `None`
    /// if the token was never issued or was already settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn take_reservation(
        &self,
        token: ReservationToken,
    ) -> impl Future<Output = Result<Option<Reservation>, StoreError>> + Send;

    // =========================================================================
    // Orders
    // =========================================================================

    /// Insert an order with its line items, consuming the given
    /// reservation records, all in one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the order number is taken,
    /// [`StoreError::DataCorruption`] if a reservation record is missing,
    /// or another `StoreError` if the insert fails. On error nothing is
    /// persisted and no reservation is consumed.
    fn insert_order(
        &self,
        new: NewOrder,
        tokens: &[ReservationToken],
    ) -> impl Future<Output = Result<Order, StoreError>> + Send;

    /// Fetch an order by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn order(&self, id: OrderId) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Fetch an order by order number.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn order_by_number(
        &self,
        number: &str,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Fetch an order's line items.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn line_items(
        &self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<LineItem>, StoreError>> + Send;

    /// Compare-and-swap an order's status. Returns true iff the order
    /// existed with status `from` and was updated to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Write the derived payment status column. Returns false if the order
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_payment_status(
        &self,
        id: OrderId,
        status: PaymentStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    // =========================================================================
    // Payments
    // =========================================================================

    /// Insert a payment attempt in `initiated` status.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_payment(
        &self,
        new: NewPayment,
    ) -> impl Future<Output = Result<Payment, StoreError>> + Send;

    /// Fetch a payment by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn payment(
        &self,
        id: PaymentId,
    ) -> impl Future<Output = Result<Option<Payment>, StoreError>> + Send;

    /// Fetch an order's payments, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn payments_for_order(
        &self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<Payment>, StoreError>> + Send;

    /// Compare-and-swap a payment's status. Returns true iff the payment
    /// existed with status `from` and was updated to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_payment_attempt_status(
        &self,
        id: PaymentId,
        from: PaymentAttemptStatus,
        to: PaymentAttemptStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record the provider's id for a payment. Returns false if the
    /// payment does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_provider_payment_id(
        &self,
        id: PaymentId,
        provider_payment_id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Fetch payments still `initiated` that were recorded before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn initiated_payments_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Payment>, StoreError>> + Send;

    // =========================================================================
    // Returns
    // =========================================================================

    /// Insert a return request in `requested` status, with its lines, as
    /// one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn insert_return(
        &self,
        new: NewReturn,
    ) -> impl Future<Output = Result<ReturnRequest, StoreError>> + Send;

    /// Fetch a return by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn return_request(
        &self,
        id: ReturnId,
    ) -> impl Future<Output = Result<Option<ReturnRequest>, StoreError>> + Send;

    /// Fetch an order's returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn returns_for_order(
        &self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<ReturnRequest>, StoreError>> + Send;

    /// Compare-and-swap a return's status. Returns true iff the return
    /// existed with status `from` and was updated to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn set_return_status(
        &self,
        id: ReturnId,
        from: ReturnStatus,
        to: ReturnStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomically move a return from `approved` to `completed` and record
    /// its refund amount. Returns true iff the return existed in
    /// `approved` and was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn complete_return(
        &self,
        id: ReturnId,
        refund_amount: Decimal,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
