// Booking orchestration
pub mod booking;
pub mod reconciliation;

// Cart and slots
pub mod cart_store;
pub mod slot_resolver;

// Payments and vendor placement
pub mod payments;
pub mod vendors;
