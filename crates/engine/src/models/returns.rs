//! Return request models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockroom_core::{LineItemId, OrderId, ReturnId, ReturnStatus};

/// A post-delivery return request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRequest {
    /// Unique return ID.
    pub id: ReturnId,
    /// Order the return is against.
    pub order_id: OrderId,
    /// Return status.
    pub status: ReturnStatus,
    /// Customer-supplied reason.
    pub reason: String,
    /// Which line items come back, and how many units of each.
    pub lines: Vec<ReturnLine>,
    /// The refunded value, recorded at completion.
    pub refund_amount: Option<Decimal>,
    /// When the return was requested.
    pub requested_at: DateTime<Utc>,
}

/// One line of a return: a line item of the order and the units coming back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReturnLine {
    /// Line item being returned.
    pub line_item_id: LineItemId,
    /// Units coming back, must be positive.
    pub quantity: u32,
}

/// Parameters for opening a return.
#[derive(Debug, Clone)]
pub struct NewReturn {
    /// Order the return is against.
    pub order_id: OrderId,
    /// Customer-supplied reason.
    pub reason: String,
    /// Lines coming back.
    pub lines: Vec<ReturnLine>,
}
