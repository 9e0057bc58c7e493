//! Domain models persisted and mutated by the engine.

pub mod catalog;
pub mod customer;
pub mod inventory;
pub mod order;
pub mod payment;
pub mod returns;

pub use catalog::{Category, NewCategory, NewProduct, NewReview, Product, ProductImage, Review, SupplierLink};
pub use customer::{Address, Customer, CustomerProfile, NewAddress, NewCustomer};
pub use inventory::{Reservation, StockLevel};
pub use order::{CartLine, CheckoutCharges, LineItem, NewLineItem, NewOrder, Order};
pub use payment::{NewPayment, Payment, PaymentOutcome};
pub use returns::{NewReturn, ReturnLine, ReturnRequest};
