use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::VendorKey;

/// Identifiers a vendor issued for an order, kept for later status lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorReference {
    pub booking_id: Uuid,
    pub vendor: VendorKey,
    pub vendor_order_id: String,
    /// Vendor-specific extras (reference code, order link, token).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl VendorReference {
    pub fn new(booking_id: Uuid, vendor: VendorKey, vendor_order_id: impl Into<String>) -> Self {
        Self {
            booking_id,
            vendor,
            vendor_order_id: vendor_order_id.into(),
            attributes: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait VendorReferenceRepository: Send + Sync {
    async fn record(&self, reference: VendorReference) -> Result<(), ServiceError>;
    async fn for_booking(&self, booking_id: Uuid) -> Result<Vec<VendorReference>, ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVendorReferenceRepository {
    references: DashMap<Uuid, Vec<VendorReference>>,
}

impl InMemoryVendorReferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VendorReferenceRepository for InMemoryVendorReferenceRepository {
    async fn record(&self, reference: VendorReference) -> Result<(), ServiceError> {
        let mut refs = self.references.entry(reference.booking_id).or_default();
        // A retry may re-place an order with the same vendor; last write wins.
        refs.retain(|r| r.vendor != reference.vendor);
        refs.push(reference);
        Ok(())
    }

    async fn for_booking(&self, booking_id: Uuid) -> Result<Vec<VendorReference>, ServiceError> {
        Ok(self
            .references
            .get(&booking_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}
