use dashmap::{DashMap, DashSet};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::RemoteCart;
use crate::models::{BookingMarker, Cart, CartEntry, CartKind, TimeSlot};
use crate::repositories::CartRepository;

/// Per-user cart with three mirrors: the in-memory view handed to callers,
/// the durable cache behind [`CartRepository`], and the remote cart record.
///
/// Every mutation is written to the cache first and then pushed to the remote
/// cart. A failed push never fails the mutation; the user is marked dirty and
/// the push is repeated by [`CartStore::sync_pending`] or the next successful
/// mutation for that user.
///
/// Mutations for one user are serialised; different users never contend.
pub struct CartStore {
    repository: Arc<dyn CartRepository>,
    remote: Arc<dyn RemoteCart>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    dirty: DashSet<Uuid>,
    events: EventSender,
}

impl CartStore {
    pub fn new(
        repository: Arc<dyn CartRepository>,
        remote: Arc<dyn RemoteCart>,
        events: EventSender,
    ) -> Self {
        Self {
            repository,
            remote,
            locks: DashMap::new(),
            dirty: DashSet::new(),
            events,
        }
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops per-user locks nobody holds. A user's next mutation creates a
    /// fresh one.
    pub fn prune_idle_locks(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    async fn load(&self, user_id: Uuid) -> Result<Cart, ServiceError> {
        Ok(self
            .repository
            .get(user_id)
            .await?
            .unwrap_or_else(|| Cart::empty(user_id)))
    }

    /// Persists locally, then mirrors remotely on a best-effort basis.
    async fn commit(&self, cart: &Cart) -> Result<(), ServiceError> {
        self.repository.put(cart).await?;
        self.events.send_or_log(Event::CartUpdated {
            user_id: cart.user_id,
            entries: cart.entries.len(),
        });
        self.mirror(cart).await;
        Ok(())
    }

    async fn mirror(&self, cart: &Cart) {
        match self.remote.push(cart).await {
            Ok(()) => {
                if self.dirty.remove(&cart.user_id).is_some() {
                    info!(user_id = %cart.user_id, "deferred cart sync completed");
                }
            }
            Err(e) => {
                warn!(user_id = %cart.user_id, error = %e, "remote cart push failed; will retry");
                self.dirty.insert(cart.user_id);
                counter!("carebook.cart.sync_deferred", 1);
                self.events.send_or_log(Event::CartSyncDeferred {
                    user_id: cart.user_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Ordered snapshot of the user's cart from the local cache.
    pub async fn snapshot(&self, user_id: Uuid) -> Result<Cart, ServiceError> {
        self.load(user_id).await
    }

    /// Adds an entry, or updates the existing entry with the same
    /// de-duplication key in place. Markers are only ever set by the booking
    /// saga; one supplied by the caller is dropped, and one already on the
    /// entry being updated is kept.
    ///
    /// # Returns
    ///
    /// * `Ok(Cart)` - The cart after the mutation
    /// * `Err(ServiceError::ValidationError)` - Quantity or price is invalid
    #[instrument(skip(self, entry), fields(user_id = %entry.user_id(), kind = %entry.kind()))]
    pub async fn add(&self, mut entry: CartEntry) -> Result<Cart, ServiceError> {
        if entry.quantity() == 0 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        if entry.unit_price().is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "unit price cannot be negative".to_string(),
            ));
        }
        entry.set_marker(None);
        let user_id = entry.user_id();
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        let id = cart.upsert(entry);
        self.commit(&cart).await?;
        debug!(entry_id = %id, "cart entry stored");
        Ok(cart)
    }

    /// Removes an entry. Removing an unknown id is a no-op; removing a paid,
    /// unconfirmed entry is refused.
    #[instrument(skip(self))]
    pub async fn remove(&self, user_id: Uuid, entry_id: Uuid) -> Result<Cart, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        if let Some(entry) = cart.get(entry_id) {
            ensure_unmarked(std::iter::once(entry))?;
        }
        if cart.remove(entry_id).is_some() {
            self.commit(&cart).await?;
        }
        Ok(cart)
    }

    /// Removes several entries in one mutation, marked or not. Used once the
    /// entries are booked.
    pub async fn remove_many(&self, user_id: Uuid, entry_ids: &[Uuid]) -> Result<Cart, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        let removed = entry_ids
            .iter()
            .filter(|id| cart.remove(**id).is_some())
            .count();
        if removed > 0 {
            self.commit(&cart).await?;
        }
        Ok(cart)
    }

    #[instrument(skip(self, slot))]
    pub async fn set_slot(
        &self,
        user_id: Uuid,
        entry_id: Uuid,
        slot: Option<TimeSlot>,
    ) -> Result<Cart, ServiceError> {
        self.update_entry(user_id, entry_id, |entry| {
            entry.set_slot(slot);
            Ok(())
        })
        .await
    }

    /// Changes a diagnostic entry's quantity. Appointments are always quantity 1.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        user_id: Uuid,
        entry_id: Uuid,
        quantity: u32,
    ) -> Result<Cart, ServiceError> {
        if quantity == 0 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        self.update_entry(user_id, entry_id, |entry| match entry {
            CartEntry::Diagnostic(d) => {
                d.quantity = quantity;
                Ok(())
            }
            CartEntry::Appointment(_) => Err(ServiceError::ValidationError(
                "appointments cannot change quantity".to_string(),
            )),
        })
        .await
    }

    pub async fn set_remote_item_id(
        &self,
        user_id: Uuid,
        entry_id: Uuid,
        item_id: String,
    ) -> Result<Cart, ServiceError> {
        self.update_entry(user_id, entry_id, |entry| {
            entry.set_remote_item_id(Some(item_id));
            Ok(())
        })
        .await
    }

    /// Sets (or with `None` clears) the booking marker on each listed entry
    /// still in the cart.
    pub async fn set_marker(
        &self,
        user_id: Uuid,
        entry_ids: &[Uuid],
        marker: Option<BookingMarker>,
    ) -> Result<Cart, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        let mut changed = false;
        for id in entry_ids {
            if let Some(entry) = cart.get_mut(*id) {
                entry.set_marker(marker.clone());
                changed = true;
            }
        }
        if changed {
            cart.touch();
            self.commit(&cart).await?;
        }
        Ok(cart)
    }

    /// Clears every marker written for `booking_id`, once support has settled
    /// it. Returns how many entries were released.
    pub async fn release_markers(&self, user_id: Uuid, booking_id: Uuid) -> Result<usize, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        let mut released = 0;
        for entry in cart.entries.iter_mut() {
            let owned = matches!(
                entry.marker(),
                Some(BookingMarker::PaymentReceivedBookingPending { booking_id: b, .. }) if *b == booking_id
            );
            if owned {
                entry.set_marker(None);
                released += 1;
            }
        }
        if released > 0 {
            cart.touch();
            self.commit(&cart).await?;
        }
        Ok(released)
    }

    async fn update_entry<F>(&self, user_id: Uuid, entry_id: Uuid, f: F) -> Result<Cart, ServiceError>
    where
        F: FnOnce(&mut CartEntry) -> Result<(), ServiceError>,
    {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        let entry = cart
            .get_mut(entry_id)
            .ok_or_else(|| ServiceError::NotFound(format!("cart entry {} not found", entry_id)))?;
        f(entry)?;
        cart.touch();
        self.commit(&cart).await?;
        Ok(cart)
    }

    /// Removes only entries of `kind`; the other partition is untouched.
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid, kind: CartKind) -> Result<usize, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        ensure_unmarked(cart.entries_of(kind))?;
        let removed = cart.clear_kind(kind);
        if removed > 0 {
            self.commit(&cart).await?;
        }
        Ok(removed)
    }

    /// Replaces the `kind` partition wholesale, as when the user switches to
    /// another center or vendor.
    #[instrument(skip(self, entries))]
    pub async fn replace(
        &self,
        user_id: Uuid,
        kind: CartKind,
        entries: Vec<CartEntry>,
    ) -> Result<Cart, ServiceError> {
        if entries
            .iter()
            .any(|e| e.kind() != kind || e.user_id() != user_id)
        {
            return Err(ServiceError::ValidationError(
                "replacement entries must match the user and cart kind".to_string(),
            ));
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        ensure_unmarked(cart.entries_of(kind))?;
        cart.clear_kind(kind);
        for mut entry in entries {
            entry.set_marker(None);
            cart.upsert(entry);
        }
        self.commit(&cart).await?;
        Ok(cart)
    }

    /// Reads the remote cart. On success the remote copy wins and replaces the
    /// local cache; on failure the local cache is returned unchanged. A pending
    /// local push is attempted first so unsynced mutations get their chance.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, user_id: Uuid) -> Result<Cart, ServiceError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut cart = self.load(user_id).await?;
        if self.dirty.contains(&user_id) {
            self.mirror(&cart).await;
        }

        match self.remote.fetch(user_id).await {
            Ok(remote_entries) => {
                let remote_entries: Vec<CartEntry> = remote_entries
                    .into_iter()
                    .filter(|e| e.user_id() == user_id)
                    .collect();
                if remote_entries != cart.entries {
                    info!(
                        local = cart.entries.len(),
                        remote = remote_entries.len(),
                        "remote cart differs; remote wins"
                    );
                    cart.entries = remote_entries;
                    cart.touch();
                    self.repository.put(&cart).await?;
                }
                self.dirty.remove(&user_id);
                Ok(cart)
            }
            Err(e) => {
                warn!(error = %e, "remote cart unreachable; serving local cache");
                Ok(cart)
            }
        }
    }

    /// Retries the remote push for every user with unsynced mutations.
    /// Returns how many users were brought in sync.
    pub async fn sync_pending(&self) -> usize {
        let users: Vec<Uuid> = self.dirty.iter().map(|u| *u).collect();
        let mut synced = 0;
        for user_id in users {
            let lock = self.user_lock(user_id);
            let _guard = lock.lock().await;
            let cart = match self.load(user_id).await {
                Ok(cart) => cart,
                Err(e) => {
                    warn!(%user_id, error = %e, "cannot load cart for deferred sync");
                    continue;
                }
            };
            self.mirror(&cart).await;
            if !self.dirty.contains(&user_id) {
                synced += 1;
            }
        }
        synced
    }

    pub fn is_dirty(&self, user_id: Uuid) -> bool {
        self.dirty.contains(&user_id)
    }

    /// Users whose remote cart is behind the local one.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

/// Paid but unconfirmed entries stay put until a retry books them or support
/// releases them.
fn ensure_unmarked<'a>(mut entries: impl Iterator<Item = &'a CartEntry>) -> Result<(), ServiceError> {
    match entries.find(|e| e.marker().is_some()) {
        Some(entry) => Err(ServiceError::Conflict(format!(
            "payment already received for entry {}; retry the booking or contact support",
            entry.id()
        ))),
        None => Ok(()),
    }
}
