//! Stockroom Core - Shared types library.
//!
//! This crate provides the common types used across the Stockroom workspace:
//! - `engine` - The order-fulfillment and inventory-consistency engine
//! - `integration-tests` - Cross-component and concurrency scenarios
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no database access, no async.
//! This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs, validated emails and SKUs,
//!   currency codes, and the status enums driving the engine's state machines

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
