// Storefront
pub mod addresses;
pub mod carts;
pub mod checkout;
pub mod orders;

// Promotions
pub mod coupons;

// Payments
pub mod payments;

// Background jobs
pub mod cms_sync;
