//! Engine error taxonomy.

use rust_decimal::Decimal;
use stockroom_core::{OrderId, ProductId, WarehouseId};
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the engine's services.
///
/// The variants partition failures by what the caller should do next:
/// [`Validation`](EngineError::Validation) and
/// [`InvalidTransition`](EngineError::InvalidTransition) are caller bugs or
/// stale views and must not be retried as-is;
/// [`Conflict`](EngineError::Conflict) means a concurrent writer won and the
/// operation may be retried with backoff;
/// [`Persistence`](EngineError::Persistence) wraps store failures, which may
/// be transient.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A reservation or decrement would drive stock below zero.
    #[error(
        "insufficient stock for product {product} in warehouse {warehouse}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        /// Product whose stock ran short.
        product: ProductId,
        /// Warehouse the stock was requested from.
        warehouse: WarehouseId,
        /// Quantity the caller asked for.
        requested: u32,
        /// Quantity actually on hand when the request was evaluated.
        available: i64,
    },

    /// A status change that the entity's transition graph does not allow.
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Entity kind ("order", "payment", "return").
        entity: &'static str,
        /// Status the entity was in.
        from: String,
        /// Status the caller asked for.
        to: String,
    },

    /// Settling this payment would push the order's settled sum past its total.
    #[error("overpayment on order {order}: {attempted} settled against a total of {total}")]
    Overpayment {
        /// Order the payment was recorded against.
        order: OrderId,
        /// Sum of settled payments had the attempt been accepted.
        attempted: Decimal,
        /// The order's total.
        total: Decimal,
    },

    /// The persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Malformed or inconsistent input; retrying the same call cannot succeed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A concurrent writer changed the entity first; retry with backoff.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind ("order", "product", ...).
        entity: &'static str,
        /// The id that failed to resolve.
        id: String,
    },
}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = EngineError::InsufficientStock {
            product: ProductId::new(7),
            warehouse: WarehouseId::new(2),
            requested: 3,
            available: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("product 7"));
        assert!(msg.contains("warehouse 2"));
        assert!(msg.contains("requested 3"));
        assert!(msg.contains("available 1"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::invalid_transition("order", "shipped", "pending");
        assert_eq!(
            err.to_string(),
            "invalid order transition from shipped to pending"
        );
    }

    #[test]
    fn test_store_error_converts_to_persistence() {
        let err: EngineError = StoreError::Conflict("order number taken".into()).into();
        assert!(matches!(err, EngineError::Persistence(_)));
    }
}
