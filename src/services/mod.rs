// Checkout core services
pub mod cart;
pub mod checkout;
pub mod draft;
pub mod payment_gateway;
pub mod pending_order;
pub mod persistence;
