//! `PostgreSQL` store backend.
//!
//! ## Tables
//!
//! - `customer`, `customer_profile`, `address`
//! - `product`, `category`, `review` (images, supplier links, and tags are
//!   JSONB columns on `product`)
//! - `stock_level`, `reservation`
//! - `orders`, `line_item`
//! - `payment`
//! - `return_request` (lines are a JSONB column)
//!
//! Statuses and currency codes are stored as text and re-parsed on read;
//! values that fail to parse surface as [`StoreError::DataCorruption`].
//! Queries are bound at runtime, so the crate builds without a live
//! database.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use stockroom_core::{
    AddressId, CategoryId, CustomerId, Email, LineItemId, OrderId, OrderStatus,
    PaymentAttemptStatus, PaymentId, PaymentStatus, ProductId, ReservationToken, ReturnId,
    ReturnStatus, ReviewId, Sku, WarehouseId,
};
use uuid::Uuid;

use crate::models::{
    Address, Category, Customer, CustomerProfile, LineItem, NewAddress, NewCategory, NewCustomer,
    NewOrder, NewPayment, NewProduct, NewReturn, NewReview, Order, Payment, Product, Reservation,
    ReturnRequest, Review, StockLevel,
};
use crate::store::{StockAdjustment, Store, StoreError};

// =============================================================================
// Helpers
// =============================================================================

fn map_unique(e: sqlx::Error, message: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return StoreError::Conflict(message.to_owned());
    }
    StoreError::Database(e)
}

fn parse_column<T>(raw: &str, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::DataCorruption(format!("invalid {column} in database: {e}")))
}

fn quantity_column(raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw)
        .map_err(|_| StoreError::DataCorruption(format!("quantity {raw} out of range")))
}

fn decode_json<T: DeserializeOwned>(
    value: serde_json::Value,
    column: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::DataCorruption(format!("invalid {column} in database: {e}")))
}

fn encode_json<T: Serialize>(value: &T, column: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::DataCorruption(format!("failed to serialize {column}: {e}")))
}

// =============================================================================
// Internal Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: i32,
    email: String,
    name: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = StoreError;

    fn try_from(row: CustomerRow) -> Result<Self, Self::Error> {
        let email = Email::parse(&row.email).map_err(|e| {
            StoreError::DataCorruption(format!("invalid email in database: {e}"))
        })?;

        Ok(Self {
            id: CustomerId::new(row.id),
            email,
            name: row.name,
            password_hash: row.password_hash,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    customer_id: i32,
    phone: Option<String>,
    marketing_opt_in: bool,
}

impl From<ProfileRow> for CustomerProfile {
    fn from(row: ProfileRow) -> Self {
        Self {
            customer_id: CustomerId::new(row.customer_id),
            phone: row.phone,
            marketing_opt_in: row.marketing_opt_in,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AddressRow {
    id: i32,
    customer_id: i32,
    line1: String,
    line2: Option<String>,
    city: String,
    region: Option<String>,
    postal_code: String,
    country: String,
}

impl From<AddressRow> for Address {
    fn from(row: AddressRow) -> Self {
        Self {
            id: AddressId::new(row.id),
            customer_id: CustomerId::new(row.customer_id),
            line1: row.line1,
            line2: row.line2,
            city: row.city,
            region: row.region,
            postal_code: row.postal_code,
            country: row.country,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: i32,
    sku: String,
    name: String,
    description: Option<String>,
    price: Decimal,
    category_id: Option<i32>,
    active: bool,
    images: serde_json::Value,
    suppliers: serde_json::Value,
    tags: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ProductId::new(row.id),
            sku: parse_column(&row.sku, "sku")?,
            name: row.name,
            description: row.description,
            price: row.price,
            category_id: row.category_id.map(CategoryId::new),
            active: row.active,
            images: decode_json(row.images, "images")?,
            suppliers: decode_json(row.suppliers, "suppliers")?,
            tags: decode_json(row.tags, "tags")?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CategoryRow {
    id: i32,
    name: String,
    parent_id: Option<i32>,
}

impl From<CategoryRow> for Category {
    fn from(row: CategoryRow) -> Self {
        Self {
            id: CategoryId::new(row.id),
            name: row.name,
            parent_id: row.parent_id.map(CategoryId::new),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReviewRow {
    id: i32,
    product_id: i32,
    customer_id: Option<i32>,
    rating: i16,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for Review {
    type Error = StoreError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        let rating = u8::try_from(row.rating).map_err(|_| {
            StoreError::DataCorruption(format!("rating {} out of range", row.rating))
        })?;

        Ok(Self {
            id: ReviewId::new(row.id),
            product_id: ProductId::new(row.product_id),
            customer_id: row.customer_id.map(CustomerId::new),
            rating,
            body: row.body,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StockRow {
    product_id: i32,
    warehouse_id: i32,
    quantity: i64,
}

impl From<StockRow> for StockLevel {
    fn from(row: StockRow) -> Self {
        Self {
            product_id: ProductId::new(row.product_id),
            warehouse_id: WarehouseId::new(row.warehouse_id),
            quantity: row.quantity,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReservationRow {
    token: Uuid,
    product_id: i32,
    warehouse_id: i32,
    quantity: i64,
    reserved_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            token: ReservationToken::from(row.token),
            product_id: ProductId::new(row.product_id),
            warehouse_id: WarehouseId::new(row.warehouse_id),
            quantity: quantity_column(row.quantity)?,
            reserved_at: row.reserved_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i32,
    order_number: String,
    customer_id: i32,
    status: String,
    payment_status: String,
    shipping_address_id: i32,
    billing_address_id: i32,
    subtotal: Decimal,
    shipping_cost: Decimal,
    tax: Decimal,
    total: Decimal,
    currency: String,
    placed_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: OrderId::new(row.id),
            order_number: row.order_number,
            customer_id: CustomerId::new(row.customer_id),
            status: parse_column(&row.status, "order status")?,
            payment_status: parse_column(&row.payment_status, "payment status")?,
            shipping_address_id: AddressId::new(row.shipping_address_id),
            billing_address_id: AddressId::new(row.billing_address_id),
            subtotal: row.subtotal,
            shipping_cost: row.shipping_cost,
            tax: row.tax,
            total: row.total,
            currency: parse_column(&row.currency, "currency")?,
            placed_at: row.placed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LineItemRow {
    id: i32,
    order_id: i32,
    product_id: i32,
    warehouse_id: i32,
    product_name: String,
    sku: String,
    unit_price: Decimal,
    quantity: i64,
    line_total: Decimal,
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = StoreError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: LineItemId::new(row.id),
            order_id: OrderId::new(row.order_id),
            product_id: ProductId::new(row.product_id),
            warehouse_id: WarehouseId::new(row.warehouse_id),
            product_name: row.product_name,
            sku: parse_column(&row.sku, "sku")?,
            unit_price: row.unit_price,
            quantity: quantity_column(row.quantity)?,
            line_total: row.line_total,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: i32,
    order_id: i32,
    provider: String,
    provider_payment_id: Option<String>,
    amount: Decimal,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PaymentId::new(row.id),
            order_id: OrderId::new(row.order_id),
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            amount: row.amount,
            currency: parse_column(&row.currency, "currency")?,
            status: parse_column(&row.status, "payment attempt status")?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReturnRow {
    id: i32,
    order_id: i32,
    status: String,
    reason: String,
    lines: serde_json::Value,
    refund_amount: Option<Decimal>,
    requested_at: DateTime<Utc>,
}

impl TryFrom<ReturnRow> for ReturnRequest {
    type Error = StoreError;

    fn try_from(row: ReturnRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ReturnId::new(row.id),
            order_id: OrderId::new(row.order_id),
            status: parse_column(&row.status, "return status")?,
            reason: row.reason,
            lines: decode_json(row.lines, "return lines")?,
            refund_amount: row.refund_amount,
            requested_at: row.requested_at,
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// `PostgreSQL`-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `PostgreSQL` with sensible pool defaults.
    ///
    /// # Errors
    ///
    /// Returns `sqlx::Error` if the connection cannot be established.
    pub async fn connect(database_url: &SecretString) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url.expose_secret())
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Store for PgStore {
    // =========================================================================
    // Customers
    // =========================================================================

    async fn insert_customer(&self, new: NewCustomer) -> Result<Customer, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r"
            INSERT INTO customer (email, name, password_hash)
            VALUES ($1, $2, $3)
            RETURNING id, email, name, password_hash, created_at
            ",
        )
        .bind(new.email.as_str())
        .bind(&new.name)
        .bind(&new.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, "email already registered"))?;

        row.try_into()
    }

    async fn customer(&self, id: CustomerId) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r"
            SELECT id, email, name, password_hash, created_at
            FROM customer
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn customer_by_email(&self, email: &Email) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r"
            SELECT id, email, name, password_hash, created_at
            FROM customer
            WHERE email = $1
            ",
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn upsert_profile(&self, profile: CustomerProfile) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO customer_profile (customer_id, phone, marketing_opt_in)
            VALUES ($1, $2, $3)
            ON CONFLICT (customer_id)
            DO UPDATE SET phone = EXCLUDED.phone, marketing_opt_in = EXCLUDED.marketing_opt_in
            ",
        )
        .bind(profile.customer_id)
        .bind(&profile.phone)
        .bind(profile.marketing_opt_in)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn profile(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerProfile>, StoreError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r"
            SELECT customer_id, phone, marketing_opt_in
            FROM customer_profile
            WHERE customer_id = $1
            ",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert_address(&self, new: NewAddress) -> Result<Address, StoreError> {
        let row = sqlx::query_as::<_, AddressRow>(
            r"
            INSERT INTO address (customer_id, line1, line2, city, region, postal_code, country)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, customer_id, line1, line2, city, region, postal_code, country
            ",
        )
        .bind(new.customer_id)
        .bind(&new.line1)
        .bind(&new.line2)
        .bind(&new.city)
        .bind(&new.region)
        .bind(&new.postal_code)
        .bind(&new.country)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn address(&self, id: AddressId) -> Result<Option<Address>, StoreError> {
        let row = sqlx::query_as::<_, AddressRow>(
            r"
            SELECT id, customer_id, line1, line2, city, region, postal_code, country
            FROM address
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn addresses_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Address>, StoreError> {
        let rows = sqlx::query_as::<_, AddressRow>(
            r"
            SELECT id, customer_id, line1, line2, city, region, postal_code, country
            FROM address
            WHERE customer_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    async fn insert_product(&self, new: NewProduct) -> Result<Product, StoreError> {
        let images = encode_json(&new.images, "images")?;
        let suppliers = encode_json(&new.suppliers, "suppliers")?;
        let tags = encode_json(&new.tags, "tags")?;

        let row = sqlx::query_as::<_, ProductRow>(
            r"
            INSERT INTO product (sku, name, description, price, category_id, active,
                                 images, suppliers, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, sku, name, description, price, category_id, active,
                      images, suppliers, tags, created_at
            ",
        )
        .bind(new.sku.as_str())
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.category_id)
        .bind(new.active)
        .bind(images)
        .bind(suppliers)
        .bind(tags)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, "sku already registered"))?;

        row.try_into()
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, sku, name, description, price, category_id, active,
                   images, suppliers, tags, created_at
            FROM product
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn product_by_sku(&self, sku: &Sku) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, sku, name, description, price, category_id, active,
                   images, suppliers, tags, created_at
            FROM product
            WHERE sku = $1
            ",
        )
        .bind(sku.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn set_product_active(&self, id: ProductId, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE product
            SET active = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_product_category(
        &self,
        id: ProductId,
        category_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE product
            SET category_id = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(category_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_category(&self, new: NewCategory) -> Result<Category, StoreError> {
        let row = sqlx::query_as::<_, CategoryRow>(
            r"
            INSERT INTO category (name, parent_id)
            VALUES ($1, $2)
            RETURNING id, name, parent_id
            ",
        )
        .bind(&new.name)
        .bind(new.parent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError> {
        let row = sqlx::query_as::<_, CategoryRow>(
            r"
            SELECT id, name, parent_id
            FROM category
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn categories(&self) -> Result<Vec<Category>, StoreError> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            r"
            SELECT id, name, parent_id
            FROM category
            ORDER BY id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_category_parent(
        &self,
        id: CategoryId,
        parent_id: Option<CategoryId>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE category
            SET parent_id = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(parent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, StoreError> {
        let row = sqlx::query_as::<_, ReviewRow>(
            r"
            INSERT INTO review (product_id, customer_id, rating, body)
            VALUES ($1, $2, $3, $4)
            RETURNING id, product_id, customer_id, rating, body, created_at
            ",
        )
        .bind(new.product_id)
        .bind(new.customer_id)
        .bind(i16::from(new.rating))
        .bind(&new.body)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn reviews_for_product(&self, product_id: ProductId) -> Result<Vec<Review>, StoreError> {
        let rows = sqlx::query_as::<_, ReviewRow>(
            r"
            SELECT id, product_id, customer_id, rating, body, created_at
            FROM review
            WHERE product_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    async fn stock_level(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<StockLevel>, StoreError> {
        let row = sqlx::query_as::<_, StockRow>(
            r"
            SELECT product_id, warehouse_id, quantity
            FROM stock_level
            WHERE product_id = $1 AND warehouse_id = $2
            ",
        )
        .bind(product_id)
        .bind(warehouse_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn adjust_stock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        delta: i64,
    ) -> Result<StockAdjustment, StoreError> {
        if delta > 0 {
            let quantity: i64 = sqlx::query_scalar(
                r"
                INSERT INTO stock_level (product_id, warehouse_id, quantity)
                VALUES ($1, $2, $3)
                ON CONFLICT (product_id, warehouse_id)
                DO UPDATE SET quantity = stock_level.quantity + EXCLUDED.quantity
                RETURNING quantity
                ",
            )
            .bind(product_id)
            .bind(warehouse_id)
            .bind(delta)
            .fetch_one(&self.pool)
            .await?;

            return Ok(StockAdjustment::Applied { quantity });
        }

        // The guard in the WHERE clause is what keeps concurrent decrements
        // from driving the row negative.
        let updated: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE stock_level
            SET quantity = quantity + $3
            WHERE product_id = $1 AND warehouse_id = $2 AND quantity + $3 >= 0
            RETURNING quantity
            ",
        )
        .bind(product_id)
        .bind(warehouse_id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(quantity) = updated {
            return Ok(StockAdjustment::Applied { quantity });
        }

        let available: Option<i64> = sqlx::query_scalar(
            r"
            SELECT quantity
            FROM stock_level
            WHERE product_id = $1 AND warehouse_id = $2
            ",
        )
        .bind(product_id)
        .bind(warehouse_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(StockAdjustment::Insufficient {
            available: available.unwrap_or(0),
        })
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO reservation (token, product_id, warehouse_id, quantity, reserved_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(reservation.token.as_uuid())
        .bind(reservation.product_id)
        .bind(reservation.warehouse_id)
        .bind(i64::from(reservation.quantity))
        .bind(reservation.reserved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "reservation token already exists"))?;

        Ok(())
    }

    async fn take_reservation(
        &self,
        token: ReservationToken,
    ) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query_as::<_, ReservationRow>(
            r"
            DELETE FROM reservation
            WHERE token = $1
            RETURNING token, product_id, warehouse_id, quantity, reserved_at
            ",
        )
        .bind(token.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    // =========================================================================
    // Orders
    // =========================================================================

    async fn insert_order(
        &self,
        new: NewOrder,
        tokens: &[ReservationToken],
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;

        for token in tokens {
            let deleted = sqlx::query(
                r"
                DELETE FROM reservation
                WHERE token = $1
                ",
            )
            .bind(token.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if deleted == 0 {
                return Err(StoreError::DataCorruption(format!(
                    "reservation {token} missing at order insert"
                )));
            }
        }

        let row = sqlx::query_as::<_, OrderRow>(
            r"
            INSERT INTO orders (order_number, customer_id, status, payment_status,
                                shipping_address_id, billing_address_id,
                                subtotal, shipping_cost, tax, total, currency)
            VALUES ($1, $2, 'pending', 'unpaid', $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, order_number, customer_id, status, payment_status,
                      shipping_address_id, billing_address_id,
                      subtotal, shipping_cost, tax, total, currency, placed_at
            ",
        )
        .bind(&new.order_number)
        .bind(new.customer_id)
        .bind(new.shipping_address_id)
        .bind(new.billing_address_id)
        .bind(new.subtotal)
        .bind(new.shipping_cost)
        .bind(new.tax)
        .bind(new.total)
        .bind(new.currency.code())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_unique(e, "order number already exists"))?;

        for line in &new.lines {
            sqlx::query(
                r"
                INSERT INTO line_item (order_id, product_id, warehouse_id, product_name,
                                       sku, unit_price, quantity, line_total)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(row.id)
            .bind(line.product_id)
            .bind(line.warehouse_id)
            .bind(&line.product_name)
            .bind(line.sku.as_str())
            .bind(line.unit_price)
            .bind(i64::from(line.quantity))
            .bind(line.line_total)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        row.try_into()
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, order_number, customer_id, status, payment_status,
                   shipping_address_id, billing_address_id,
                   subtotal, shipping_cost, tax, total, currency, placed_at
            FROM orders
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, order_number, customer_id, status, payment_status,
                   shipping_address_id, billing_address_id,
                   subtotal, shipping_cost, tax, total, currency, placed_at
            FROM orders
            WHERE order_number = $1
            ",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn line_items(&self, order_id: OrderId) -> Result<Vec<LineItem>, StoreError> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            r"
            SELECT id, order_id, product_id, warehouse_id, product_name,
                   sku, unit_price, quantity, line_total
            FROM line_item
            WHERE order_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = $3
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_payment_status(
        &self,
        id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET payment_status = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r"
            INSERT INTO payment (order_id, provider, amount, currency, status)
            VALUES ($1, $2, $3, $4, 'initiated')
            RETURNING id, order_id, provider, provider_payment_id, amount, currency,
                      status, created_at
            ",
        )
        .bind(new.order_id)
        .bind(&new.provider)
        .bind(new.amount)
        .bind(new.currency.code())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r"
            SELECT id, order_id, provider, provider_payment_id, amount, currency,
                   status, created_at
            FROM payment
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            r"
            SELECT id, order_id, provider, provider_payment_id, amount, currency,
                   status, created_at
            FROM payment
            WHERE order_id = $1
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_payment_attempt_status(
        &self,
        id: PaymentId,
        from: PaymentAttemptStatus,
        to: PaymentAttemptStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE payment
            SET status = $3
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_provider_payment_id(
        &self,
        id: PaymentId,
        provider_payment_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE payment
            SET provider_payment_id = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(provider_payment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn initiated_payments_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            r"
            SELECT id, order_id, provider, provider_payment_id, amount, currency,
                   status, created_at
            FROM payment
            WHERE status = 'initiated' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    // =========================================================================
    // Returns
    // =========================================================================

    async fn insert_return(&self, new: NewReturn) -> Result<ReturnRequest, StoreError> {
        let lines = encode_json(&new.lines, "return lines")?;

        let row = sqlx::query_as::<_, ReturnRow>(
            r"
            INSERT INTO return_request (order_id, status, reason, lines)
            VALUES ($1, 'requested', $2, $3)
            RETURNING id, order_id, status, reason, lines, refund_amount, requested_at
            ",
        )
        .bind(new.order_id)
        .bind(&new.reason)
        .bind(lines)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn return_request(&self, id: ReturnId) -> Result<Option<ReturnRequest>, StoreError> {
        let row = sqlx::query_as::<_, ReturnRow>(
            r"
            SELECT id, order_id, status, reason, lines, refund_amount, requested_at
            FROM return_request
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn returns_for_order(&self, order_id: OrderId) -> Result<Vec<ReturnRequest>, StoreError> {
        let rows = sqlx::query_as::<_, ReturnRow>(
            r"
            SELECT id, order_id, status, reason, lines, refund_amount, requested_at
            FROM return_request
            WHERE order_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_return_status(
        &self,
        id: ReturnId,
        from: ReturnStatus,
        to: ReturnStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE return_request
            SET status = $3
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_return(
        &self,
        id: ReturnId,
        refund_amount: Decimal,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE return_request
            SET status = 'completed', refund_amount = $2
            WHERE id = $1 AND status = 'approved'
            ",
        )
        .bind(id)
        .bind(refund_amount)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
