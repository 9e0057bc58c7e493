//! The engine facade.
//!
//! Wires every service to one shared store, gateway, activity log, and
//! per-order lock table, and hands out references to them. Cloning an
//! [`Engine`] is cheap and every clone operates on the same state, so one
//! engine can serve many tasks.

use std::sync::Arc;

use crate::activity::{ActivityLog, TracingActivityLog};
use crate::config::EngineConfig;
use crate::gateway::{PaymentGateway, StaticGateway};
use crate::lock::EntityLocks;
use crate::services::{
    CatalogService, CustomerService, InventoryLedger, LifecycleController, OrderBuilder,
    PaymentCoordinator, ReturnsProcessor,
};
use crate::store::{MemoryStore, Store};

/// The assembled fulfillment engine.
pub struct Engine<S, G = StaticGateway> {
    config: EngineConfig,
    customers: CustomerService<S>,
    catalog: CatalogService<S>,
    inventory: InventoryLedger<S>,
    orders: OrderBuilder<S>,
    lifecycle: LifecycleController<S>,
    payments: PaymentCoordinator<S, G>,
    returns: ReturnsProcessor<S, G>,
}

impl<S, G> Clone for Engine<S, G> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            customers: self.customers.clone(),
            catalog: self.catalog.clone(),
            inventory: self.inventory.clone(),
            orders: self.orders.clone(),
            lifecycle: self.lifecycle.clone(),
            payments: self.payments.clone(),
            returns: self.returns.clone(),
        }
    }
}

impl<S: Store, G: PaymentGateway> Engine<S, G> {
    /// Assemble an engine over a store and a payment gateway.
    #[must_use]
    pub fn new(
        store: S,
        gateway: G,
        activity: Arc<dyn ActivityLog>,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(store);
        let gateway = Arc::new(gateway);
        let locks = Arc::new(EntityLocks::new());

        let customers = CustomerService::new(Arc::clone(&store), Arc::clone(&activity));
        let catalog = CatalogService::new(Arc::clone(&store), Arc::clone(&activity));
        let inventory = InventoryLedger::new(
            Arc::clone(&store),
            Arc::clone(&activity),
            config.clone(),
        );
        let orders = OrderBuilder::new(
            Arc::clone(&store),
            inventory.clone(),
            Arc::clone(&activity),
            config.clone(),
        );
        let lifecycle = LifecycleController::new(
            Arc::clone(&store),
            inventory.clone(),
            Arc::clone(&locks),
            Arc::clone(&activity),
            config.clone(),
        );
        let payments = PaymentCoordinator::new(
            Arc::clone(&store),
            gateway,
            Arc::clone(&locks),
            Arc::clone(&activity),
            config.clone(),
        );
        let returns = ReturnsProcessor::new(
            store,
            inventory.clone(),
            payments.clone(),
            lifecycle.clone(),
            locks,
            activity,
            config.clone(),
        );

        Self {
            config,
            customers,
            catalog,
            inventory,
            orders,
            lifecycle,
            payments,
            returns,
        }
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Customer accounts, profiles, and addresses.
    #[must_use]
    pub const fn customers(&self) -> &CustomerService<S> {
        &self.customers
    }

    /// Products, categories, and reviews.
    #[must_use]
    pub const fn catalog(&self) -> &CatalogService<S> {
        &self.catalog
    }

    /// Stock levels, reservations, and restocking.
    #[must_use]
    pub const fn inventory(&self) -> &InventoryLedger<S> {
        &self.inventory
    }

    /// Checkout.
    #[must_use]
    pub const fn orders(&self) -> &OrderBuilder<S> {
        &self.orders
    }

    /// Order status transitions.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleController<S> {
        &self.lifecycle
    }

    /// Payment attempts, settlement, and refunds.
    #[must_use]
    pub const fn payments(&self) -> &PaymentCoordinator<S, G> {
        &self.payments
    }

    /// Return requests.
    #[must_use]
    pub const fn returns(&self) -> &ReturnsProcessor<S, G> {
        &self.returns
    }
}

impl Engine<MemoryStore, StaticGateway> {
    /// An engine over the in-memory store and the acknowledging gateway,
    /// logging activity through `tracing`.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            MemoryStore::new(),
            StaticGateway::new(),
            Arc::new(TracingActivityLog::new()),
            config,
        )
    }
}
