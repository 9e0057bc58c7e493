//! Customer and address models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockroom_core::{AddressId, CustomerId, Email};

/// A registered customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    /// Unique customer ID.
    pub id: CustomerId,
    /// Email address, unique across customers (stored lowercased).
    pub email: Email,
    /// Display name.
    pub name: String,
    /// Hashed credential. Hashing happens upstream; the engine only stores it.
    pub password_hash: String,
    /// When the customer registered.
    pub created_at: DateTime<Utc>,
}

/// Parameters for registering a customer.
#[derive(Debug, Clone)]
pub struct NewCustomer {
    /// Email address.
    pub email: Email,
    /// Display name.
    pub name: String,
    /// Hashed credential.
    pub password_hash: String,
}

/// Optional per-customer profile, at most one per customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    /// Customer this profile belongs to.
    pub customer_id: CustomerId,
    /// Contact phone number.
    pub phone: Option<String>,
    /// Whether the customer opted into marketing email.
    pub marketing_opt_in: bool,
}

/// A customer's saved address.
///
/// Orders reference addresses by id; an address always belongs to exactly
/// one customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    /// Unique address ID.
    pub id: AddressId,
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Street address, first line.
    pub line1: String,
    /// Street address, second line.
    pub line2: Option<String>,
    /// City.
    pub city: String,
    /// State / province / region.
    pub region: Option<String>,
    /// Postal or ZIP code.
    pub postal_code: String,
    /// ISO country code or name.
    pub country: String,
}

/// Parameters for adding an address to a customer's address book.
#[derive(Debug, Clone)]
pub struct NewAddress {
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Street address, first line.
    pub line1: String,
    /// Street address, second line.
    pub line2: Option<String>,
    /// City.
    pub city: String,
    /// State / province / region.
    pub region: Option<String>,
    /// Postal or ZIP code.
    pub postal_code: String,
    /// ISO country code or name.
    pub country: String,
}
