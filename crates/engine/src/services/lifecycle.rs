//! Order lifecycle controller.
//!
//! Drives orders through `pending → processing → shipped → delivered`
//! with `cancelled` reachable from the pre-shipment states. Every
//! transition runs under the order's lock and is persisted with a
//! compare-and-set on the expected current status, so two concurrent
//! transitions can never both win.

use std::sync::Arc;

use serde_json::json;
use stockroom_core::{OrderId, OrderStatus, PaymentStatus};
use tracing::{info, instrument, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lock::EntityLocks;
use crate::models::Order;
use crate::services::inventory::InventoryLedger;
use crate::store::Store;

/// Order lifecycle controller.
pub struct LifecycleController<S> {
    store: Arc<S>,
    inventory: InventoryLedger<S>,
    locks: Arc<EntityLocks<OrderId>>,
    activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
}

impl<S> Clone for LifecycleController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inventory: self.inventory.clone(),
            locks: Arc::clone(&self.locks),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> LifecycleController<S> {
    pub(crate) fn new(
        store: Arc<S>,
        inventory: InventoryLedger<S>,
        locks: Arc<EntityLocks<OrderId>>,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            locks,
            activity,
            config,
        }
    }

    /// Move an order to a new status.
    ///
    /// Enforces the transition graph plus the payment gate on
    /// `processing` and the open-return gate on `shipped` and
    /// `delivered`. Cancelling restocks every line item. `refunded`
    /// cannot be requested here; it is reached by completing a return
    /// that refunds the full order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the order does not exist,
    /// [`EngineError::InvalidTransition`] if the graph forbids the move,
    /// [`EngineError::Validation`] if a gate rejects it,
    /// [`EngineError::Conflict`] if the order changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(order = %order_id, to = %to))]
    pub async fn transition(&self, order_id: OrderId, to: OrderStatus) -> Result<Order, EngineError> {
        if to == OrderStatus::Refunded {
            return Err(EngineError::validation(
                "refunded status is derived from payments; complete a return instead",
            ));
        }

        let _guard = self.locks.acquire(order_id).await;

        let Some(order) = self.store.order(order_id).await? else {
            return Err(EngineError::not_found("order", order_id));
        };
        if !order.status.can_transition_to(to) {
            return Err(EngineError::invalid_transition("order", order.status, to));
        }

        match to {
            OrderStatus::Processing => {
                let paid_enough = match order.payment_status {
                    PaymentStatus::Paid => true,
                    PaymentStatus::Partial => self.config.allow_partial_processing,
                    PaymentStatus::Unpaid | PaymentStatus::Refunded => false,
                };
                if !paid_enough {
                    return Err(EngineError::validation(format!(
                        "order {order_id} is {} and cannot start processing",
                        order.payment_status
                    )));
                }
            }
            OrderStatus::Shipped | OrderStatus::Delivered => {
                let returns = self.store.returns_for_order(order_id).await?;
                if returns.iter().any(|r| r.status.is_open()) {
                    return Err(EngineError::validation(format!(
                        "order {order_id} has an open return"
                    )));
                }
            }
            OrderStatus::Pending | OrderStatus::Cancelled | OrderStatus::Refunded => {}
        }

        if !self.store.set_order_status(order_id, order.status, to).await? {
            return Err(EngineError::conflict(format!(
                "order {order_id} changed status concurrently"
            )));
        }

        if to == OrderStatus::Cancelled {
            self.restock_lines(order_id).await?;
        }

        info!(order_id = %order_id, from = %order.status, to = %to, "Order status changed");
        self.activity.record(ActivityEvent::new(
            "order",
            order_id,
            "status_changed",
            json!({ "from": order.status, "to": to }),
        ));

        let Some(updated) = self.store.order(order_id).await? else {
            return Err(EngineError::not_found("order", order_id));
        };
        Ok(updated)
    }

    /// Mark a delivered order refunded after a full-order refund.
    ///
    /// The caller already holds the order's lock and has verified the
    /// derived payment standing; this only flips the status row.
    pub(crate) async fn apply_refunded(&self, order: &Order) -> Result<(), EngineError> {
        if !self
            .store
            .set_order_status(order.id, OrderStatus::Delivered, OrderStatus::Refunded)
            .await?
        {
            return Err(EngineError::conflict(format!(
                "order {} changed status concurrently",
                order.id
            )));
        }
        info!(order_id = %order.id, "Order marked refunded");
        self.activity.record(ActivityEvent::new(
            "order",
            order.id,
            "status_changed",
            json!({ "from": OrderStatus::Delivered, "to": OrderStatus::Refunded }),
        ));
        Ok(())
    }

    /// Return every line item's committed stock to its warehouse.
    ///
    /// The cancellation is already persisted, so a failing line is
    /// logged and skipped rather than failing the whole call.
    async fn restock_lines(&self, order_id: OrderId) -> Result<(), EngineError> {
        for item in self.store.line_items(order_id).await? {
            if let Err(e) = self
                .inventory
                .restock(item.product_id, item.warehouse_id, item.quantity)
                .await
            {
                warn!(
                    error = %e,
                    order_id = %order_id,
                    line_item = %item.id,
                    "Failed to restock a cancelled line item"
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
