//! Stock level and reservation models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockroom_core::{ProductId, ReservationToken, WarehouseId};

/// On-hand stock for one (product, warehouse) pair.
///
/// `quantity >= 0` holds after every engine operation; the quantity already
/// excludes any in-flight reservations, which decrement it at reserve time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StockLevel {
    /// Product.
    pub product_id: ProductId,
    /// Warehouse holding the stock.
    pub warehouse_id: WarehouseId,
    /// Units on hand.
    pub quantity: i64,
}

/// An in-flight stock reservation.
///
/// The reservation's quantity was already subtracted from the stock row
/// when the record was created. Settling the record via commit keeps the
/// decrement; settling via release adds the quantity back. The record is
/// deleted either way, which is what makes double-settlement detectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Opaque settlement handle.
    pub token: ReservationToken,
    /// Product reserved.
    pub product_id: ProductId,
    /// Warehouse the stock was drawn from.
    pub warehouse_id: WarehouseId,
    /// Units reserved.
    pub quantity: u32,
    /// When the reservation was taken.
    pub reserved_at: DateTime<Utc>,
}
