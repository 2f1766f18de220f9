mod common;

use assert_matches::assert_matches;
use carebook::{
    errors::ServiceError,
    integrations::{gateway::sign_completion, GatewayClient},
    models::{CartKind, PaymentState, VendorKey},
    services::{
        booking::{BookingDraft, PaymentStep, SagaState},
        payments::{CheckoutOutcome, GatewayPaymentCoordinator, PaymentCoordinator},
    },
};
use common::{diagnostic, payer, profile, slot, Harness, ScriptedVendor};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{basic_auth, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "gateway-secret";

async fn gateway_with_order(order_id: &str, amount_minor: i64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .and(basic_auth("rzp_test", SECRET))
        .and(body_partial_json(json!({ "amount": amount_minor, "currency": "INR" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": order_id,
            "amount": amount_minor,
            "currency": "INR",
            "status": "created",
        })))
        .mount(&server)
        .await;
    server
}

fn coordinator(server: &MockServer, window: Duration) -> Arc<GatewayPaymentCoordinator> {
    let client = GatewayClient::new(server.uri(), "rzp_test", SECRET, Duration::from_secs(2)).unwrap();
    Arc::new(GatewayPaymentCoordinator::new(client, "INR", window))
}

#[tokio::test]
async fn verified_completion_captures_the_payment() {
    let server = gateway_with_order("order_A1", 50000).await;
    let payments = coordinator(&server, Duration::from_secs(5));

    let charging = {
        let payments = payments.clone();
        tokio::spawn(async move { payments.charge("ORD-1", dec!(500), &payer()).await })
    };
    let session = payments
        .pending_session("ORD-1", Duration::from_secs(2))
        .await
        .expect("checkout session opened");
    assert_eq!(session.session_id, "order_A1");
    assert_eq!(session.amount, 50000);
    assert_eq!(session.key_id, "rzp_test");
    assert_eq!(payments.open_sessions(), 1);

    payments
        .complete(
            "order_A1",
            CheckoutOutcome::Completed {
                payment_id: "pay_A1".into(),
                signature: sign_completion(SECRET, "order_A1", "pay_A1"),
            },
        )
        .await
        .unwrap();

    let transaction = charging.await.unwrap().unwrap();
    assert_eq!(transaction.state, PaymentState::Captured);
    assert_eq!(transaction.reference(), "pay_A1");
    assert_eq!(payments.open_sessions(), 0);
}

#[tokio::test]
async fn forged_signature_fails_the_payment() {
    let server = gateway_with_order("order_B1", 50000).await;
    let payments = coordinator(&server, Duration::from_secs(5));

    let charging = {
        let payments = payments.clone();
        tokio::spawn(async move { payments.charge("ORD-2", dec!(500), &payer()).await })
    };
    payments.pending_session("ORD-2", Duration::from_secs(2)).await.unwrap();
    payments
        .complete(
            "order_B1",
            CheckoutOutcome::Completed {
                payment_id: "pay_B1".into(),
                signature: sign_completion("wrong", "order_B1", "pay_B1"),
            },
        )
        .await
        .unwrap();

    let transaction = charging.await.unwrap().unwrap();
    assert_eq!(transaction.state, PaymentState::Failed);
    assert!(transaction.failure_reason.unwrap().contains("verified"));
}

#[tokio::test]
async fn elapsed_window_counts_as_cancelled() {
    let server = gateway_with_order("order_C1", 50000).await;
    let payments = coordinator(&server, Duration::from_millis(100));

    let transaction = payments.charge("ORD-3", dec!(500), &payer()).await.unwrap();

    assert_eq!(transaction.state, PaymentState::Cancelled);
    assert_matches!(
        payments.complete("order_C1", CheckoutOutcome::Dismissed).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn dropped_charge_closes_its_session() {
    let server = gateway_with_order("order_E1", 50000).await;
    let payments = coordinator(&server, Duration::from_secs(30));

    let charging = {
        let payments = payments.clone();
        tokio::spawn(async move { payments.charge("ORD-6", dec!(500), &payer()).await })
    };
    payments.pending_session("ORD-6", Duration::from_secs(2)).await.unwrap();
    assert_eq!(payments.open_sessions(), 1);

    charging.abort();
    assert!(charging.await.unwrap_err().is_cancelled());

    assert_eq!(payments.open_sessions(), 0);
    assert!(payments.pending_session("ORD-6", Duration::from_millis(50)).await.is_none());
    assert_matches!(
        payments.complete("order_E1", CheckoutOutcome::Dismissed).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn gateway_outage_is_an_error_not_a_transaction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let payments = coordinator(&server, Duration::from_secs(1));

    assert_matches!(
        payments.charge("ORD-4", dec!(500), &payer()).await,
        Err(ServiceError::UpstreamUnavailable(_))
    );
    assert_matches!(
        payments.charge("ORD-5", dec!(0), &payer()).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn checkout_flow_settles_booking_from_callback() {
    let server = gateway_with_order("order_D1", 50000).await;
    let payments = coordinator(&server, Duration::from_secs(5));
    let h = Harness::builder()
        .vendor(ScriptedVendor::new(VendorKey::LabNetwork))
        .payments(payments.clone())
        .build();
    let user = Uuid::new_v4();
    h.add(diagnostic(user, "CBC", VendorKey::LabNetwork, dec!(500))).await;

    let view = h
        .bookings
        .start(BookingDraft {
            user_id: user,
            kind: CartKind::Diagnostic,
            beneficiary: Some(profile()),
            entry_ids: Vec::new(),
            slot: Some(slot(VendorKey::LabNetwork, "s-far", (2099, 1, 1), 10, 0)),
            notes: None,
        })
        .await
        .unwrap();

    let step = h
        .bookings
        .pay_or_checkout(view.booking_id, payer(), Duration::from_secs(2))
        .await
        .unwrap();
    let session = assert_matches!(step, PaymentStep::AwaitingPayment { session } => session);
    assert_eq!(session.receipt, view.idempotency_key);
    assert_eq!(
        h.bookings.get(view.booking_id).unwrap().state,
        SagaState::PaymentPending
    );

    payments
        .complete(
            &session.session_id,
            CheckoutOutcome::Completed {
                payment_id: "pay_D1".into(),
                signature: sign_completion(SECRET, &session.session_id, "pay_D1"),
            },
        )
        .await
        .unwrap();

    let mut updates = tokio::time::interval(Duration::from_millis(20));
    let mut state = SagaState::PaymentPending;
    for _ in 0..100 {
        updates.tick().await;
        state = h.bookings.get(view.booking_id).unwrap().state;
        if state.is_terminal() {
            break;
        }
    }
    assert_eq!(state, SagaState::Completed);
    assert!(h.partition(user, CartKind::Diagnostic).await.is_empty());
}
