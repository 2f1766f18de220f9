//! The booking saga: appointment creation, sponsorship, cart commit, payment
//! and vendor order placement, with a per-beneficiary lease around each run.

pub mod lease;
pub mod saga;
pub mod service;
pub mod state;

pub use lease::{LeaseGuard, LeaseKey, LeaseRegistry};
pub use saga::{
    BookingDraft, BookingOrchestrator, BookingOutcome, BookingSaga, BookingView, Collaborators,
    DetachHandle, PlacedOrder, SagaSettings, VendorOrderView,
};
pub use service::{BookingService, PaymentStep};
pub use state::{SagaState, Transition};
