//! Order and line item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockroom_core::{
    AddressId, CurrencyCode, CustomerId, LineItemId, OrderId, OrderStatus, PaymentStatus,
    ProductId, Sku, WarehouseId,
};

/// One line of a checkout cart: a product, the warehouse to draw stock
/// from, and how many units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CartLine {
    /// Product to buy.
    pub product_id: ProductId,
    /// Warehouse to fulfill from.
    pub warehouse_id: WarehouseId,
    /// Units requested, must be positive.
    pub quantity: u32,
}

/// Pre-quoted charges supplied by the external pricing/tax collaborator.
///
/// The engine validates non-negativity but otherwise treats these as
/// opaque inputs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckoutCharges {
    /// Quoted shipping cost.
    pub shipping_cost: Decimal,
    /// Quoted tax.
    pub tax: Decimal,
    /// Currency the order settles in.
    pub currency: CurrencyCode,
}

/// A persisted order.
///
/// Orders are created once and thereafter mutated only through status and
/// payment-status transitions. `total = subtotal + shipping_cost + tax`
/// holds for every persisted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID.
    pub id: OrderId,
    /// Human-readable order number, unique, e.g. `SR-20260823-049271`.
    pub order_number: String,
    /// Customer who placed the order.
    pub customer_id: CustomerId,
    /// Fulfillment status.
    pub status: OrderStatus,
    /// Derived payment standing, written only by the payment coordinator.
    pub payment_status: PaymentStatus,
    /// Shipping destination.
    pub shipping_address_id: AddressId,
    /// Billing address.
    pub billing_address_id: AddressId,
    /// Sum of line totals.
    pub subtotal: Decimal,
    /// Quoted shipping cost.
    pub shipping_cost: Decimal,
    /// Quoted tax.
    pub tax: Decimal,
    /// Grand total.
    pub total: Decimal,
    /// Currency the order settles in.
    pub currency: CurrencyCode,
    /// When the order was placed.
    pub placed_at: DateTime<Utc>,
}

impl Order {
    /// Format the grand total for receipts and activity payloads,
    /// e.g. `$24.50`.
    #[must_use]
    pub fn display_total(&self) -> String {
        format!("{}{:.2}", self.currency.symbol(), self.total)
    }
}

/// An immutable snapshot of one purchased product.
///
/// Name, SKU, and unit price are copied from the product at purchase time
/// so later catalog edits never rewrite order history. The warehouse is
/// recorded so cancellations and returns restock the same row the stock
/// was drawn from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    /// Unique line item ID.
    pub id: LineItemId,
    /// Order this line belongs to.
    pub order_id: OrderId,
    /// Product purchased.
    pub product_id: ProductId,
    /// Warehouse the stock was drawn from.
    pub warehouse_id: WarehouseId,
    /// Product name at purchase time.
    pub product_name: String,
    /// Product SKU at purchase time.
    pub sku: Sku,
    /// Unit price at purchase time.
    pub unit_price: Decimal,
    /// Units purchased.
    pub quantity: u32,
    /// `unit_price * quantity`.
    pub line_total: Decimal,
}

/// A fully validated order ready for insertion.
///
/// Built by the order builder after reservation; the store assigns the
/// order and line item IDs.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Generated order number.
    pub order_number: String,
    /// Customer placing the order.
    pub customer_id: CustomerId,
    /// Shipping destination.
    pub shipping_address_id: AddressId,
    /// Billing address.
    pub billing_address_id: AddressId,
    /// Sum of line totals.
    pub subtotal: Decimal,
    /// Quoted shipping cost.
    pub shipping_cost: Decimal,
    /// Quoted tax.
    pub tax: Decimal,
    /// Grand total.
    pub total: Decimal,
    /// Currency the order settles in.
    pub currency: CurrencyCode,
    /// Line item snapshots.
    pub lines: Vec<NewLineItem>,
}

/// One line of a [`NewOrder`].
#[derive(Debug, Clone)]
pub struct NewLineItem {
    /// Product purchased.
    pub product_id: ProductId,
    /// Warehouse the stock was drawn from.
    pub warehouse_id: WarehouseId,
    /// Product name at purchase time.
    pub product_name: String,
    /// Product SKU at purchase time.
    pub sku: Sku,
    /// Unit price at purchase time.
    pub unit_price: Decimal,
    /// Units purchased.
    pub quantity: u32,
    /// `unit_price * quantity`.
    pub line_total: Decimal,
}
