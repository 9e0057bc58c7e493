//! Inventory ledger service.
//!
//! Tracks on-hand stock per (product, warehouse) pair and brokers the
//! reservation protocol that checkout runs on:
//! 1. `reserve` atomically decrements the stock row and issues a token
//! 2. `commit` settles the token, keeping the decrement
//! 3. `release` settles the token, adding the units back
//!
//! A token settles exactly once; the store's single-shot
//! `take_reservation` is what makes double settlement detectable. Stock
//! never goes below zero because the decrement itself is conditional.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use stockroom_core::{ProductId, ReservationToken, WarehouseId};
use tracing::{info, instrument, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{Reservation, StockLevel};
use crate::store::{StockAdjustment, Store, StoreError};

/// Inventory ledger service.
pub struct InventoryLedger<S> {
    store: Arc<S>,
    activity: Arc<dyn ActivityLog>,
    config: EngineConfig,
}

impl<S> Clone for InventoryLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> InventoryLedger<S> {
    pub(crate) fn new(store: Arc<S>, activity: Arc<dyn ActivityLog>, config: EngineConfig) -> Self {
        Self {
            store,
            activity,
            config,
        }
    }

    /// Look up on-hand stock for one (product, warehouse) pair.
    ///
    /// Returns `None` if no stock row exists, which callers should treat
    /// as zero on hand.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn stock_level(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<StockLevel>, EngineError> {
        Ok(self.store.stock_level(product_id, warehouse_id).await?)
    }

    /// Reserve `quantity` units, decrementing stock and issuing a token.
    ///
    /// The decrement happens up front, so concurrent reservations can
    /// never jointly oversell a row: each one either gets its units or
    /// fails with the quantity that was actually available.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if `quantity` is zero,
    /// [`EngineError::InsufficientStock`] if the row cannot cover the
    /// request, or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(product = %product_id, warehouse = %warehouse_id, quantity))]
    pub async fn reserve(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity: u32,
    ) -> Result<ReservationToken, EngineError> {
        if quantity == 0 {
            return Err(EngineError::validation(
                "reservation quantity must be positive",
            ));
        }

        match self
            .adjust_with_retry(product_id, warehouse_id, -i64::from(quantity))
            .await?
        {
            StockAdjustment::Applied {
                quantity: remaining,
            } => {
                let token = ReservationToken::generate();
                let reservation = Reservation {
                    token,
                    product_id,
                    warehouse_id,
                    quantity,
                    reserved_at: Utc::now(),
                };

                if let Err(e) = self.store.insert_reservation(reservation).await {
                    // The decrement already happened; put the units back
                    // before surfacing the failure.
                    if let Err(undo) = self
                        .adjust_with_retry(product_id, warehouse_id, i64::from(quantity))
                        .await
                    {
                        warn!(
                            error = %undo,
                            product = %product_id,
                            warehouse = %warehouse_id,
                            quantity,
                            "Failed to restore stock after reservation insert failure"
                        );
                    }
                    return Err(e.into());
                }

                info!(token = %token, remaining, "Reserved stock");
                self.activity.record(ActivityEvent::new(
                    "reservation",
                    token,
                    "reserved",
                    json!({
                        "product_id": product_id,
                        "warehouse_id": warehouse_id,
                        "quantity": quantity,
                        "remaining": remaining,
                    }),
                ));

                Ok(token)
            }
            StockAdjustment::Insufficient { available } => Err(EngineError::InsufficientStock {
                product: product_id,
                warehouse: warehouse_id,
                requested: quantity,
                available,
            }),
        }
    }

    /// Settle a reservation, keeping its decrement.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the token was already
    /// settled or never issued, or [`EngineError::Persistence`] if the
    /// store fails.
    #[instrument(skip(self), fields(token = %token))]
    pub async fn commit(&self, token: ReservationToken) -> Result<(), EngineError> {
        let Some(reservation) = self.store.take_reservation(token).await? else {
            return Err(EngineError::validation(format!(
                "reservation {token} already settled or unknown"
            )));
        };

        info!(
            product = %reservation.product_id,
            warehouse = %reservation.warehouse_id,
            quantity = reservation.quantity,
            "Committed reservation"
        );
        self.activity.record(ActivityEvent::new(
            "reservation",
            token,
            "committed",
            json!({
                "product_id": reservation.product_id,
                "warehouse_id": reservation.warehouse_id,
                "quantity": reservation.quantity,
            }),
        ));

        Ok(())
    }

    /// Settle a reservation, adding its units back to stock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the token was already
    /// settled or never issued, or [`EngineError::Persistence`] if the
    /// store fails.
    #[instrument(skip(self), fields(token = %token))]
    pub async fn release(&self, token: ReservationToken) -> Result<(), EngineError> {
        let Some(reservation) = self.store.take_reservation(token).await? else {
            return Err(EngineError::validation(format!(
                "reservation {token} already settled or unknown"
            )));
        };

        match self
            .adjust_with_retry(
                reservation.product_id,
                reservation.warehouse_id,
                i64::from(reservation.quantity),
            )
            .await
        {
            Ok(_) => {}
            Err(e) => {
                // The record is already consumed, so the units are not
                // recoverable through this token anymore.
                warn!(
                    error = %e,
                    token = %token,
                    "Failed to restore stock while releasing reservation"
                );
                return Err(e);
            }
        }

        info!(
            product = %reservation.product_id,
            warehouse = %reservation.warehouse_id,
            quantity = reservation.quantity,
            "Released reservation"
        );
        self.activity.record(ActivityEvent::new(
            "reservation",
            token,
            "released",
            json!({
                "product_id": reservation.product_id,
                "warehouse_id": reservation.warehouse_id,
                "quantity": reservation.quantity,
            }),
        ));

        Ok(())
    }

    /// Add units to stock outside the reservation protocol.
    ///
    /// Used for inbound deliveries and by cancellations and returns when
    /// they put sold units back. Creates the stock row if none exists.
    /// Returns the new on-hand count.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if `quantity` is zero, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(product = %product_id, warehouse = %warehouse_id, quantity))]
    pub async fn restock(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity: u32,
    ) -> Result<i64, EngineError> {
        if quantity == 0 {
            return Err(EngineError::validation("restock quantity must be positive"));
        }

        match self
            .adjust_with_retry(product_id, warehouse_id, i64::from(quantity))
            .await?
        {
            StockAdjustment::Applied { quantity: on_hand } => {
                info!(on_hand, "Restocked");
                self.activity.record(ActivityEvent::new(
                    "stock",
                    format!("{product_id}/{warehouse_id}"),
                    "restocked",
                    json!({
                        "product_id": product_id,
                        "warehouse_id": warehouse_id,
                        "quantity": quantity,
                        "on_hand": on_hand,
                    }),
                ));
                Ok(on_hand)
            }
            StockAdjustment::Insufficient { .. } => Err(EngineError::Persistence(
                StoreError::DataCorruption("store rejected a positive stock adjustment".to_string()),
            )),
        }
    }

    /// Run a stock adjustment, retrying transient write conflicts with
    /// backoff and jitter.
    async fn adjust_with_retry(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        delta: i64,
    ) -> Result<StockAdjustment, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.adjust_stock(product_id, warehouse_id, delta).await {
                Ok(adjustment) => return Ok(adjustment),
                Err(StoreError::Conflict(_)) if attempt < self.config.stock_retry_attempts => {
                    attempt += 1;
                    let base = self.config.stock_retry_backoff_ms;
                    let jitter = rand::rng().random_range(0..base.max(1));
                    tokio::time::sleep(Duration::from_millis(base * u64::from(attempt) + jitter))
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
