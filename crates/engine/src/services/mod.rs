//! Engine services.
//!
//! Each service owns one slice of the domain and shares the store, the
//! activity log, and (where cross-order safety demands it) the per-order
//! lock table with its siblings. Services are built once by
//! [`Engine`](crate::engine::Engine) and handed out by reference.

pub mod catalog;
pub mod customers;
pub mod inventory;
pub mod lifecycle;
pub mod orders;
pub mod payments;
pub mod returns;

pub use catalog::CatalogService;
pub use customers::CustomerService;
pub use inventory::InventoryLedger;
pub use lifecycle::LifecycleController;
pub use orders::OrderBuilder;
pub use payments::{PaymentCoordinator, derive_payment_status};
pub use returns::ReturnsProcessor;
