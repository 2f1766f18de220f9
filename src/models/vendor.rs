use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// External booking vendors the engine knows how to talk to.
///
/// `Clinic` is the generic slot-based clinic API used for consultations; the
/// remaining four are diagnostics partners with their own request shapes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VendorKey {
    /// Generic clinic slot/booking service.
    Clinic,
    /// Slot-based clinic partner; needs a branch id and has its own slot schema.
    PartnerClinic,
    /// Postpaid home-collection vendor (API key via login, XML beneficiary block).
    HomeCollection,
    /// On-demand phlebotomy vendor (ISO slot datetime, geocoordinates).
    Phlebotomy,
    /// Traditional lab network (structured demographics, code + description).
    LabNetwork,
}

impl VendorKey {
    pub const ALL: [VendorKey; 5] = [
        VendorKey::Clinic,
        VendorKey::PartnerClinic,
        VendorKey::HomeCollection,
        VendorKey::Phlebotomy,
        VendorKey::LabNetwork,
    ];

    /// Vendors whose slot query needs a branch/clinic id on top of doctor + date.
    pub fn requires_branch(&self) -> bool {
        matches!(self, VendorKey::PartnerClinic)
    }

    pub fn is_diagnostics(&self) -> bool {
        !matches!(self, VendorKey::Clinic)
    }
}
