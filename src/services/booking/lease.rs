use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Beneficiary, CartKind};

/// One booking in flight per user, beneficiary and cart partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub user_id: Uuid,
    pub beneficiary: Beneficiary,
    pub kind: CartKind,
}

#[derive(Debug, Default)]
pub struct LeaseRegistry {
    held: DashMap<LeaseKey, Uuid>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `booking_id`, or fails with `Conflict` naming the
    /// booking that holds it.
    pub fn acquire(self: &Arc<Self>, key: LeaseKey, booking_id: Uuid) -> Result<LeaseGuard, ServiceError> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(holder) => Err(ServiceError::Conflict(format!(
                "booking {} is already in progress for this {} cart",
                holder.get(),
                key.kind
            ))),
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
                debug!(%booking_id, kind = %key.kind, "lease acquired");
                Ok(LeaseGuard {
                    registry: Arc::clone(self),
                    key,
                    booking_id,
                })
            }
        }
    }

    pub fn holder(&self, key: &LeaseKey) -> Option<Uuid> {
        self.held.get(key).map(|b| *b)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases the lease when dropped.
#[derive(Debug)]
pub struct LeaseGuard {
    registry: Arc<LeaseRegistry>,
    key: LeaseKey,
    booking_id: Uuid,
}

impl LeaseGuard {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let booking_id = self.booking_id;
        if self
            .registry
            .held
            .remove_if(&self.key, |_, holder| *holder == booking_id)
            .is_some()
        {
            debug!(%booking_id, "lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user_id: Uuid, kind: CartKind) -> LeaseKey {
        LeaseKey {
            user_id,
            beneficiary: Beneficiary::AccountHolder,
            kind,
        }
    }

    #[test]
    fn second_acquire_conflicts_until_release() {
        let leases = Arc::new(LeaseRegistry::new());
        let user = Uuid::new_v4();
        let first = leases.acquire(key(user, CartKind::Appointment), Uuid::new_v4()).unwrap();

        let second = leases.acquire(key(user, CartKind::Appointment), Uuid::new_v4());
        assert!(matches!(second, Err(ServiceError::Conflict(_))));

        drop(first);
        assert!(leases.is_empty());
        assert!(leases.acquire(key(user, CartKind::Appointment), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn partitions_and_beneficiaries_do_not_contend() {
        let leases = Arc::new(LeaseRegistry::new());
        let user = Uuid::new_v4();
        let _a = leases.acquire(key(user, CartKind::Appointment), Uuid::new_v4()).unwrap();
        let _d = leases.acquire(key(user, CartKind::Diagnostic), Uuid::new_v4()).unwrap();
        let dependent = LeaseKey {
            user_id: user,
            beneficiary: Beneficiary::Dependent {
                dependent_id: Uuid::new_v4(),
            },
            kind: CartKind::Appointment,
        };
        let _c = leases.acquire(dependent, Uuid::new_v4()).unwrap();
        assert_eq!(leases.len(), 3);
    }
}
