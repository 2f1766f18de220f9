mod common;

use assert_matches::assert_matches;
use carebook::{
    errors::ServiceError,
    models::{BookingMarker, CartEntry, CartKind, VendorKey},
};
use chrono::Utc;
use common::{consultation, diagnostic, Harness};
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use uuid::Uuid;

#[tokio::test]
async fn same_test_at_same_vendor_updates_in_place() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let first = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.add(diagnostic(user, "TSH", VendorKey::LabNetwork, dec!(300))).await;

    let cart = h
        .carts
        .add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(450)))
        .await
        .unwrap();

    assert_eq!(cart.entries.len(), 2);
    assert_eq!(cart.entries[0].id(), first);
    assert_eq!(cart.entries[0].unit_price(), dec!(450));
}

#[tokio::test]
async fn same_test_at_other_vendor_is_a_separate_entry() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.add(diagnostic(user, "CBC", VendorKey::Phlebotomy, dec!(480))).await;

    assert_eq!(h.partition(user, CartKind::Diagnostic).await.len(), 2);
}

#[tokio::test]
async fn a_new_consultation_replaces_the_previous_one() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(consultation(user, "doc-1", dec!(700))).await;
    h.add(consultation(user, "doc-2", dec!(900))).await;

    let appointments = h.partition(user, CartKind::Appointment).await;
    assert_eq!(appointments.len(), 1);
    assert_eq!(appointments[0].service_ref(), "doc-2");
}

#[tokio::test]
async fn clearing_one_partition_keeps_the_other() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(consultation(user, "doc-1", dec!(700))).await;
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.add(diagnostic(user, "TSH", VendorKey::LabNetwork, dec!(300))).await;

    let removed = h.carts.clear(user, CartKind::Diagnostic).await.unwrap();

    assert_eq!(removed, 2);
    assert!(h.partition(user, CartKind::Diagnostic).await.is_empty());
    assert_eq!(h.partition(user, CartKind::Appointment).await.len(), 1);
}

#[tokio::test]
async fn replace_swaps_the_partition_and_checks_ownership() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(consultation(user, "doc-1", dec!(700))).await;
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;

    let cart = h
        .carts
        .replace(
            user,
            CartKind::Diagnostic,
            vec![diagnostic(user, "LIPID", VendorKey::Phlebotomy, dec!(650))],
        )
        .await
        .unwrap();
    let diagnostics: Vec<&CartEntry> = cart.entries_of(CartKind::Diagnostic).collect();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].service_ref(), "LIPID");
    assert_eq!(cart.entries_of(CartKind::Appointment).count(), 1);

    let foreign = diagnostic(Uuid::new_v4(), "CBC", VendorKey::LabNetwork, dec!(500));
    assert_matches!(
        h.carts.replace(user, CartKind::Diagnostic, vec![foreign]).await,
        Err(ServiceError::ValidationError(_))
    );
    let wrong_kind = consultation(user, "doc-3", dec!(400));
    assert_matches!(
        h.carts.replace(user, CartKind::Diagnostic, vec![wrong_kind]).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn quantities_and_prices_are_validated() {
    let h = Harness::standard();
    let user = Uuid::new_v4();

    let mut zero = diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500));
    if let CartEntry::Diagnostic(d) = &mut zero {
        d.quantity = 0;
    }
    assert_matches!(h.carts.add(zero).await, Err(ServiceError::ValidationError(_)));
    assert_matches!(
        h.carts
            .add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(-1)))
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let test = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    let cart = h.carts.set_quantity(user, test, 3).await.unwrap();
    assert_eq!(cart.get(test).unwrap().line_total(), dec!(1500));

    let visit = h.add(consultation(user, "doc-1", dec!(700))).await;
    assert_matches!(
        h.carts.set_quantity(user, visit, 2).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        h.carts.set_quantity(user, Uuid::new_v4(), 2).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn removing_unknown_entry_is_a_no_op() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;

    let cart = h.carts.remove(user, Uuid::new_v4()).await.unwrap();
    assert_eq!(cart.entries.len(), 1);
}

#[tokio::test]
async fn mutations_are_mirrored_to_the_remote_cart() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let id = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;

    assert_eq!(h.clinic.remote_entries(user).len(), 1);
    h.carts.remove(user, id).await.unwrap();
    assert!(h.clinic.remote_entries(user).is_empty());
    assert!(!h.carts.is_dirty(user));
}

#[tokio::test]
async fn failed_push_keeps_local_change_and_syncs_later() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.clinic.fail_push.store(true, Ordering::SeqCst);

    let cart = h
        .carts
        .add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500)))
        .await
        .expect("local mutation succeeds");

    assert_eq!(cart.entries.len(), 1);
    assert!(h.carts.is_dirty(user));
    assert_eq!(h.carts.dirty_count(), 1);
    assert!(h.clinic.remote_entries(user).is_empty());

    assert_eq!(h.carts.sync_pending().await, 0);
    h.clinic.fail_push.store(false, Ordering::SeqCst);
    assert_eq!(h.carts.sync_pending().await, 1);
    assert!(!h.carts.is_dirty(user));
    assert_eq!(h.clinic.remote_entries(user).len(), 1);
}

#[tokio::test]
async fn reconcile_lets_the_remote_cart_win() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    let remote_only = diagnostic(user, "HBA1C", VendorKey::Phlebotomy, dec!(400));
    h.clinic
        .remote
        .lock()
        .unwrap()
        .insert(user, vec![remote_only.clone()]);

    let cart = h.carts.reconcile(user).await.unwrap();

    assert_eq!(cart.entries, vec![remote_only]);
    assert_eq!(h.carts.snapshot(user).await.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn reconcile_serves_local_cache_when_remote_is_down() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.clinic.remote.lock().unwrap().clear();
    h.clinic.fail_fetch.store(true, Ordering::SeqCst);

    let cart = h.carts.reconcile(user).await.unwrap();
    assert_eq!(cart.entries.len(), 1);
}

#[tokio::test]
async fn reconcile_pushes_pending_changes_before_reading() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    h.clinic.fail_push.store(true, Ordering::SeqCst);
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.clinic.fail_push.store(false, Ordering::SeqCst);

    let cart = h.carts.reconcile(user).await.unwrap();

    assert_eq!(cart.entries.len(), 1);
    assert!(!h.carts.is_dirty(user));
}

#[tokio::test]
async fn markers_can_be_set_and_cleared() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let id = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    let marker = BookingMarker::PaymentReceivedBookingPending {
        booking_id: Uuid::new_v4(),
        transaction_id: "pay_9".into(),
        vendor: VendorKey::LabNetwork,
        reason: "timeout".into(),
        marked_at: Utc::now(),
    };

    let cart = h
        .carts
        .set_marker(user, &[id, Uuid::new_v4()], Some(marker.clone()))
        .await
        .unwrap();
    assert_eq!(cart.get(id).unwrap().marker(), Some(&marker));
    assert_eq!(h.clinic.remote_entries(user)[0].marker(), Some(&marker));

    let cart = h.carts.set_marker(user, &[id], None).await.unwrap();
    assert!(cart.get(id).unwrap().marker().is_none());
}

#[tokio::test]
async fn concurrent_adds_for_one_user_are_all_kept() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let carts = h.carts.clone();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let carts = carts.clone();
            tokio::spawn(async move {
                carts
                    .add(diagnostic(user, &format!("T{}", i), VendorKey::LabNetwork, dec!(100)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.partition(user, CartKind::Diagnostic).await.len(), 10);
}

fn pending_marker(booking_id: Uuid) -> BookingMarker {
    BookingMarker::PaymentReceivedBookingPending {
        booking_id,
        transaction_id: "pay_7".into(),
        vendor: VendorKey::LabNetwork,
        reason: "vendor timeout".into(),
        marked_at: Utc::now(),
    }
}

#[tokio::test]
async fn paid_entries_cannot_be_dropped_or_re_added_unmarked() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let booking_id = Uuid::new_v4();
    let id = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    h.carts
        .set_marker(user, &[id], Some(pending_marker(booking_id)))
        .await
        .unwrap();

    assert_matches!(h.carts.remove(user, id).await, Err(ServiceError::Conflict(_)));
    assert_matches!(
        h.carts.clear(user, CartKind::Diagnostic).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        h.carts
            .replace(
                user,
                CartKind::Diagnostic,
                vec![diagnostic(user, "TSH", VendorKey::LabNetwork, dec!(300))]
            )
            .await,
        Err(ServiceError::Conflict(_))
    );

    let cart = h
        .carts
        .add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(450)))
        .await
        .unwrap();
    assert_eq!(cart.entries.len(), 1);
    assert_eq!(cart.entries[0].id(), id);
    assert_eq!(cart.entries[0].unit_price(), dec!(450));
    assert_matches!(
        cart.entries[0].marker(),
        Some(BookingMarker::PaymentReceivedBookingPending { booking_id: b, .. }) if *b == booking_id
    );

    // Other partition is unaffected.
    h.add(consultation(user, "dr-rao", dec!(800))).await;
    assert_eq!(h.carts.clear(user, CartKind::Appointment).await.unwrap(), 1);
}

#[tokio::test]
async fn markers_supplied_with_a_new_entry_are_ignored() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let mut entry = diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500));
    entry.set_marker(Some(pending_marker(Uuid::new_v4())));

    let cart = h.carts.add(entry).await.unwrap();

    assert!(cart.entries[0].marker().is_none());
}

#[tokio::test]
async fn releasing_a_booking_frees_only_its_own_entries() {
    let h = Harness::standard();
    let user = Uuid::new_v4();
    let (settled, other) = (Uuid::new_v4(), Uuid::new_v4());
    let cbc = h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    let tsh = h.add(diagnostic(user, "TSH", VendorKey::LabNetwork, dec!(300))).await;
    h.carts.set_marker(user, &[cbc], Some(pending_marker(settled))).await.unwrap();
    h.carts.set_marker(user, &[tsh], Some(pending_marker(other))).await.unwrap();

    assert_eq!(h.carts.release_markers(user, settled).await.unwrap(), 1);
    assert_eq!(h.carts.release_markers(user, settled).await.unwrap(), 0);

    let cart = h.carts.remove(user, cbc).await.unwrap();
    assert_eq!(cart.entries.len(), 1);
    assert!(cart.get(tsh).unwrap().marker().is_some());
}

#[tokio::test]
async fn idle_user_locks_are_pruned() {
    let h = Harness::standard();
    for _ in 0..5 {
        h.add(diagnostic(Uuid::new_v4(), "CBC", VendorKey::LabNetwork, dec!(500))).await;
    }
    assert_eq!(h.carts.lock_count(), 5);

    assert_eq!(h.carts.prune_idle_locks(), 5);
    assert_eq!(h.carts.lock_count(), 0);

    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;
    assert_eq!(h.partition(user, CartKind::Diagnostic).await.len(), 1);
}
