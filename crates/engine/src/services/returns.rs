//! Returns processor.
//!
//! Handles the full return flow: a customer opens a return against an
//! eligible order, an operator approves or rejects it, and completion
//! restocks the returned units and refunds their value from the order's
//! settled payments. Cumulative bookkeeping across a line item's returns
//! ensures no unit can come back twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use stockroom_core::{
    LineItemId, OrderId, OrderStatus, PaymentAttemptStatus, PaymentStatus, ReturnId, ReturnStatus,
};
use tracing::{info, instrument};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gateway::PaymentGateway;
use crate::lock::EntityLocks;
use crate::models::{LineItem, NewReturn, ReturnRequest};
use crate::services::inventory::InventoryLedger;
use crate::services::lifecycle::LifecycleController;
use crate::services::payments::PaymentCoordinator;
use crate::store::{Store, StoreError};

/// Returns processor service.
pub struct ReturnsProcessor<S, G> {
    store: Arc<S>,
    inventory: InventoryLedger<S>,
    payments: PaymentCoordinator<S, G>,
    lifecycle: LifecycleController<S>,
    locks: Arc<EntityLocks<OrderId>>,
    activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
}

impl<S, G> Clone for ReturnsProcessor<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            inventory: self.inventory.clone(),
            payments: self.payments.clone(),
            lifecycle: self.lifecycle.clone(),
            locks: Arc::clone(&self.locks),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

impl<S: Store, G: PaymentGateway> ReturnsProcessor<S, G> {
    pub(crate) fn new(
        store: Arc<S>,
        inventory: InventoryLedger<S>,
        payments: PaymentCoordinator<S, G>,
        lifecycle: LifecycleController<S>,
        locks: Arc<EntityLocks<OrderId>>,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            payments,
            lifecycle,
            locks,
            activity,
            config,
        }
    }

    /// Open a return against an order.
    ///
    /// The order must be in a status the configured return policy
    /// accepts, every line must reference one of the order's line items,
    /// and the units requested plus everything already claimed by
    /// non-rejected returns must fit within the quantity ordered.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a blank reason, empty or
    /// zero-quantity lines, a duplicated line item, an ineligible order
    /// status, a line item from another order, or an over-return;
    /// [`EngineError::NotFound`] if the order does not exist; or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(order = %new.order_id, lines = new.lines.len()))]
    pub async fn open(&self, new: NewReturn) -> Result<ReturnRequest, EngineError> {
        if new.reason.trim().is_empty() {
            return Err(EngineError::validation("return reason cannot be empty"));
        }
        if new.lines.is_empty() {
            return Err(EngineError::validation(
                "return must name at least one line item",
            ));
        }
        let mut seen = HashSet::new();
        for line in &new.lines {
            if line.quantity == 0 {
                return Err(EngineError::validation(format!(
                    "return line for line item {} has zero quantity",
                    line.line_item_id
                )));
            }
            if !seen.insert(line.line_item_id) {
                return Err(EngineError::validation(format!(
                    "line item {} appears twice in the return",
                    line.line_item_id
                )));
            }
        }

        let _guard = self.locks.acquire(new.order_id).await;

        let Some(order) = self.store.order(new.order_id).await? else {
            return Err(EngineError::not_found("order", new.order_id));
        };
        if !self.config.return_policy.allows(order.status) {
            return Err(EngineError::validation(format!(
                "order {} is {} and not eligible for returns under the {} policy",
                order.id, order.status, self.config.return_policy
            )));
        }

        let items = self.items_by_id(new.order_id).await?;
        let already = self.returned_so_far(new.order_id).await?;
        for line in &new.lines {
            let Some(item) = items.get(&line.line_item_id) else {
                return Err(EngineError::validation(format!(
                    "line item {} does not belong to order {}",
                    line.line_item_id, new.order_id
                )));
            };
            let prior = already.get(&line.line_item_id).copied().unwrap_or(0);
            let requested = u64::from(line.quantity);
            if prior + requested > u64::from(item.quantity) {
                return Err(EngineError::validation(format!(
                    "return exceeds quantity ordered for line item {}: ordered {}, already claimed {}, requested {}",
                    line.line_item_id, item.quantity, prior, line.quantity
                )));
            }
        }

        let request = self.store.insert_return(new).await?;

        info!(return_id = %request.id, order_id = %request.order_id, "Return opened");
        self.activity.record(ActivityEvent::new(
            "return",
            request.id,
            "opened",
            json!({ "order_id": request.order_id, "lines": request.lines.len() }),
        ));

        Ok(request)
    }

    /// Approve a requested return.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the return does not exist,
    /// [`EngineError::InvalidTransition`] if it is not `requested`,
    /// [`EngineError::Conflict`] if it changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    pub async fn approve(&self, id: ReturnId) -> Result<ReturnRequest, EngineError> {
        self.moderate(id, ReturnStatus::Approved, "approved").await
    }

    /// Reject a requested return, freeing its units for future returns.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the return does not exist,
    /// [`EngineError::InvalidTransition`] if it is not `requested`,
    /// [`EngineError::Conflict`] if it changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    pub async fn reject(&self, id: ReturnId) -> Result<ReturnRequest, EngineError> {
        self.moderate(id, ReturnStatus::Rejected, "rejected").await
    }

    /// Complete an approved return: restock the units, refund their
    /// value, and record the refunded amount on the return.
    ///
    /// The refund flips settled payments newest-first and may overshoot
    /// the return's value, since refunds are all-or-nothing per payment.
    /// When the refund leaves the order fully refunded and the engine is
    /// configured to do so, a delivered order is moved to `refunded`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the return does not exist,
    /// [`EngineError::InvalidTransition`] if it is not `approved`,
    /// [`EngineError::Validation`] if settled payments cannot cover the
    /// refund, [`EngineError::Conflict`] if it changed concurrently, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(return_id = %id))]
    pub async fn complete(&self, id: ReturnId) -> Result<ReturnRequest, EngineError> {
        let Some(found) = self.store.return_request(id).await? else {
            return Err(EngineError::not_found("return", id));
        };

        let _guard = self.locks.acquire(found.order_id).await;

        let request = self.require_return(id).await?;
        if request.status != ReturnStatus::Approved {
            return Err(EngineError::invalid_transition(
                "return",
                request.status,
                ReturnStatus::Completed,
            ));
        }
        let Some(order) = self.store.order(request.order_id).await? else {
            return Err(EngineError::not_found("order", request.order_id));
        };

        let items = self.items_by_id(request.order_id).await?;
        let mut refund_amount = Decimal::ZERO;
        for line in &request.lines {
            let Some(item) = items.get(&line.line_item_id) else {
                return Err(StoreError::DataCorruption(format!(
                    "return {} references line item {} missing from order {}",
                    id, line.line_item_id, request.order_id
                ))
                .into());
            };
            refund_amount += item.unit_price * Decimal::from(line.quantity);
        }

        // Verify coverage before touching stock, so an uncoverable
        // refund leaves the return approved and retryable.
        let settled: Decimal = self
            .payments
            .payments_for_order(order.id)
            .await?
            .iter()
            .filter(|p| p.status == PaymentAttemptStatus::Successful)
            .map(|p| p.amount)
            .sum();
        if settled < refund_amount {
            return Err(EngineError::validation(format!(
                "settled payments cover {settled}, cannot refund {refund_amount}"
            )));
        }

        for line in &request.lines {
            if let Some(item) = items.get(&line.line_item_id) {
                self.inventory
                    .restock(item.product_id, item.warehouse_id, line.quantity)
                    .await?;
            }
        }

        let refunded = self.payments.refund_up_to(&order, refund_amount).await?;

        if !self.store.complete_return(id, refund_amount).await? {
            return Err(EngineError::conflict(format!(
                "return {id} changed status concurrently"
            )));
        }

        if self.config.refund_sets_order_status
            && let Some(updated) = self.store.order(order.id).await?
            && updated.payment_status == PaymentStatus::Refunded
            && updated.status == OrderStatus::Delivered
        {
            self.lifecycle.apply_refunded(&updated).await?;
        }

        info!(
            return_id = %id,
            order_id = %order.id,
            refund_amount = %refund_amount,
            refunded = %refunded,
            "Return completed"
        );
        self.activity.record(ActivityEvent::new(
            "return",
            id,
            "completed",
            json!({
                "order_id": order.id,
                "refund_amount": refund_amount,
                "payments_refunded": refunded,
            }),
        ));

        self.require_return(id).await
    }

    /// Fetch a return by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn return_request(&self, id: ReturnId) -> Result<Option<ReturnRequest>, EngineError> {
        Ok(self.store.return_request(id).await?)
    }

    /// Fetch an order's returns.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn returns_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<ReturnRequest>, EngineError> {
        Ok(self.store.returns_for_order(order_id).await?)
    }

    async fn moderate(
        &self,
        id: ReturnId,
        to: ReturnStatus,
        action: &'static str,
    ) -> Result<ReturnRequest, EngineError> {
        let Some(found) = self.store.return_request(id).await? else {
            return Err(EngineError::not_found("return", id));
        };

        let _guard = self.locks.acquire(found.order_id).await;

        let request = self.require_return(id).await?;
        if request.status != ReturnStatus::Requested {
            return Err(EngineError::invalid_transition("return", request.status, to));
        }
        if !self
            .store
            .set_return_status(id, ReturnStatus::Requested, to)
            .await?
        {
            return Err(EngineError::conflict(format!(
                "return {id} changed status concurrently"
            )));
        }

        info!(return_id = %id, order_id = %request.order_id, action, "Return moderated");
        self.activity.record(ActivityEvent::new(
            "return",
            id,
            action,
            json!({ "order_id": request.order_id }),
        ));

        self.require_return(id).await
    }

    /// Units claimed per line item by this order's non-rejected returns.
    async fn returned_so_far(
        &self,
        order_id: OrderId,
    ) -> Result<HashMap<LineItemId, u64>, EngineError> {
        let mut claimed: HashMap<LineItemId, u64> = HashMap::new();
        for request in self.store.returns_for_order(order_id).await? {
            if !request.status.counts_toward_returned() {
                continue;
            }
            for line in &request.lines {
                *claimed.entry(line.line_item_id).or_insert(0) += u64::from(line.quantity);
            }
        }
        Ok(claimed)
    }

    async fn items_by_id(
        &self,
        order_id: OrderId,
    ) -> Result<HashMap<LineItemId, LineItem>, EngineError> {
        let items = self.store.line_items(order_id).await?;
        Ok(items.into_iter().map(|item| (item.id, item)).collect())
    }

    async fn require_return(&self, id: ReturnId) -> Result<ReturnRequest, EngineError> {
        match self.store.return_request(id).await? {
            Some(request) => Ok(request),
            None => Err(EngineError::not_found("return", id)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
