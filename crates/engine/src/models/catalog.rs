//! Product, category, and review models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockroom_core::{CategoryId, CustomerId, ProductId, ReviewId, Sku, SupplierId, TagId};

/// A sellable product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Unique product ID.
    pub id: ProductId,
    /// Stock keeping unit, unique across products.
    pub sku: Sku,
    /// Display name.
    pub name: String,
    /// Long-form description.
    pub description: Option<String>,
    /// Current list price, non-negative. Orders snapshot this at purchase
    /// time; changing it never rewrites history.
    pub price: Decimal,
    /// Category the product sits in, if any.
    pub category_id: Option<CategoryId>,
    /// Whether the product can be ordered. Inactive products stay visible
    /// in history but are rejected by checkout.
    pub active: bool,
    /// Product images, ordered by `position` with exactly one primary.
    pub images: Vec<ProductImage>,
    /// Suppliers this product can be sourced from.
    pub suppliers: Vec<SupplierLink>,
    /// Tags applied to the product.
    pub tags: Vec<TagId>,
    /// When the product was registered.
    pub created_at: DateTime<Utc>,
}

/// An image attached to a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductImage {
    /// Image location.
    pub url: String,
    /// Alt text for accessibility.
    pub alt: Option<String>,
    /// Sort position within the product's gallery.
    pub position: u32,
    /// Whether this is the product's primary image.
    pub primary: bool,
}

/// A supplier the product can be sourced from, with the supplier's own
/// SKU and price where they differ from ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierLink {
    /// Supplier ID.
    pub supplier_id: SupplierId,
    /// The SKU the supplier uses for this product.
    pub supplier_sku: Option<Sku>,
    /// The supplier's unit price.
    pub supplier_price: Option<Decimal>,
}

/// Parameters for registering a product.
#[derive(Debug, Clone)]
pub struct NewProduct {
    /// Stock keeping unit.
    pub sku: Sku,
    /// Display name.
    pub name: String,
    /// Long-form description.
    pub description: Option<String>,
    /// List price, non-negative.
    pub price: Decimal,
    /// Category to file the product under.
    pub category_id: Option<CategoryId>,
    /// Whether the product is orderable immediately.
    pub active: bool,
    /// Product images.
    pub images: Vec<ProductImage>,
    /// Supplier links.
    pub suppliers: Vec<SupplierLink>,
    /// Tags.
    pub tags: Vec<TagId>,
}

/// A node in the category tree.
///
/// `parent_id = None` marks a root. The tree shape is maintained by the
/// catalog service, which validates against cycles on every re-parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    /// Unique category ID.
    pub id: CategoryId,
    /// Display name.
    pub name: String,
    /// Parent category, `None` for roots.
    pub parent_id: Option<CategoryId>,
}

/// Parameters for creating a category.
#[derive(Debug, Clone)]
pub struct NewCategory {
    /// Display name.
    pub name: String,
    /// Parent category, `None` for a root.
    pub parent_id: Option<CategoryId>,
}

/// A product review.
///
/// Reviews are deliberately not gated on purchase, and the reviewer may be
/// anonymous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    /// Unique review ID.
    pub id: ReviewId,
    /// Product being reviewed.
    pub product_id: ProductId,
    /// Reviewer, if known.
    pub customer_id: Option<CustomerId>,
    /// Star rating, 1 through 5.
    pub rating: u8,
    /// Free-form review text.
    pub body: Option<String>,
    /// When the review was submitted.
    pub created_at: DateTime<Utc>,
}

/// Parameters for submitting a review.
#[derive(Debug, Clone)]
pub struct NewReview {
    /// Product being reviewed.
    pub product_id: ProductId,
    /// Reviewer, if known.
    pub customer_id: Option<CustomerId>,
    /// Star rating, 1 through 5.
    pub rating: u8,
    /// Free-form review text.
    pub body: Option<String>,
}
