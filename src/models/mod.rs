// Booking domain models
pub mod booking;
pub mod cart;
pub mod payment;
pub mod slot;
pub mod vendor;

pub use booking::{
    BeneficiaryProfile, BookingRequest, ContactAddress, Gender, VendorOrderResult,
};
pub use cart::{
    AppointmentEntry, Beneficiary, BookingMarker, Cart, CartEntry, CartKind, DiagnosticEntry,
    EntryKey,
};
pub use payment::{PayerDetails, PaymentState, PaymentTransaction};
pub use slot::{DayPeriod, RawSlot, SlotKey, SlotQuery, TimeSlot};
pub use vendor::VendorKey;
