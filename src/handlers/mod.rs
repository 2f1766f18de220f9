pub mod bookings;
pub mod carts;
pub mod common;
pub mod health;
pub mod payments;
pub mod reconciliation;
pub mod slots;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;
