//! Stockroom Engine - order fulfillment and inventory consistency.
//!
//! This crate turns checkout requests into durably consistent orders and
//! drives orders, payments, and returns through coordinated lifecycle
//! transitions. The hard invariants it guards:
//!
//! - Stock never goes negative, no matter how many checkouts race.
//! - No partial orders: a multi-line checkout either persists with every
//!   line's stock reserved, or leaves stock exactly as it found it.
//! - Order status only moves along the fulfillment graph, and the derived
//!   payment status is always a pure function of the payment history.
//! - A completed return always restocks and refunds, or does not complete.
//!
//! # Architecture
//!
//! Everything hangs off [`Engine`], which wires the component services over
//! a shared [`store::Store`], a [`gateway::PaymentGateway`], and an
//! [`activity::ActivityLog`] sink:
//!
//! - [`services::InventoryLedger`] - reserve / commit / release / restock
//! - [`services::OrderBuilder`] - cart validation and atomic order placement
//! - [`services::LifecycleController`] - the order status state machine
//! - [`services::PaymentCoordinator`] - payment attempts and derived status
//! - [`services::ReturnsProcessor`] - post-delivery returns
//! - [`services::CatalogService`] / [`services::CustomerService`] - the
//!   entity registries the flows above validate against
//!
//! Concurrency model: stock rows are guarded by the store's atomic
//! conditional adjustments, and all mutations of one order are serialized
//! behind a per-order async lock. Operations on different orders proceed
//! independently; no lock is ever held across two orders.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod activity;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod models;
pub mod services;
pub mod store;

pub use config::{ConfigError, EngineConfig, ReturnPolicy};
pub use engine::Engine;
pub use error::EngineError;
