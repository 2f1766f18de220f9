pub mod cart_repository;
pub mod vendor_reference_repository;

pub use cart_repository::{CartRepository, InMemoryCartRepository, RedisCartRepository};
pub use vendor_reference_repository::{
    InMemoryVendorReferenceRepository, VendorReference, VendorReferenceRepository,
};
