//! Core types for Stockroom.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod email;
pub mod id;
pub mod money;
pub mod sku;
pub mod status;

pub use email::{Email, EmailError};
pub use id::*;
pub use money::CurrencyCode;
pub use sku::{Sku, SkuError};
pub use status::*;
