use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Booking saga states.
///
/// ```text
/// Draft -> AppointmentCreated -> SponsorshipChecked -> CartCommitted
///       -> PaymentPending -> {PaymentCaptured | PaymentAborted}
///       -> OrderPlacing -> {Completed | PartiallyFailed}
/// ```
///
/// Diagnostics skip `AppointmentCreated`. A zero amount goes from
/// `CartCommitted` straight to `OrderPlacing`. `PaymentAborted` falls back to
/// `CartCommitted`, and `PartiallyFailed` may re-enter `OrderPlacing` for a
/// retry that never charges again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SagaState {
    Draft,
    AppointmentCreated,
    SponsorshipChecked,
    CartCommitted,
    PaymentPending,
    PaymentCaptured,
    PaymentAborted,
    OrderPlacing,
    Completed,
    PartiallyFailed,
    /// Appointment creation or cart commit failed; nothing was charged.
    Failed,
    /// Given up by the user before any payment was captured.
    Abandoned,
}

impl SagaState {
    pub fn can_transition_to(self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Draft, AppointmentCreated)
                | (Draft, SponsorshipChecked)
                | (Draft, Failed)
                | (AppointmentCreated, SponsorshipChecked)
                | (AppointmentCreated, Failed)
                | (SponsorshipChecked, CartCommitted)
                | (SponsorshipChecked, Failed)
                | (CartCommitted, PaymentPending)
                | (CartCommitted, OrderPlacing)
                | (CartCommitted, Abandoned)
                | (PaymentPending, PaymentCaptured)
                | (PaymentPending, PaymentAborted)
                | (PaymentAborted, CartCommitted)
                | (PaymentCaptured, OrderPlacing)
                | (OrderPlacing, Completed)
                | (OrderPlacing, PartiallyFailed)
                | (PartiallyFailed, OrderPlacing)
        )
    }

    /// States that end a saga run and release its lease. `PartiallyFailed`
    /// counts: a retry only re-places orders and needs no lease.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::PartiallyFailed | SagaState::Failed | SagaState::Abandoned
        )
    }

    /// Payment captured; money has moved.
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            SagaState::PaymentCaptured
                | SagaState::OrderPlacing
                | SagaState::Completed
                | SagaState::PartiallyFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SagaState,
    pub to: SagaState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use SagaState::*;

    #[rstest]
    #[case(Draft, AppointmentCreated)]
    #[case(Draft, SponsorshipChecked)]
    #[case(CartCommitted, OrderPlacing)]
    #[case(PaymentAborted, CartCommitted)]
    #[case(PartiallyFailed, OrderPlacing)]
    fn allowed(#[case] from: SagaState, #[case] to: SagaState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Draft, PaymentPending)]
    #[case(CartCommitted, Completed)]
    #[case(PaymentAborted, OrderPlacing)]
    #[case(Completed, OrderPlacing)]
    #[case(PaymentCaptured, Abandoned)]
    #[case(OrderPlacing, Abandoned)]
    fn refused(#[case] from: SagaState, #[case] to: SagaState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states_have_no_way_out_except_retry() {
        for state in [Completed, Failed, Abandoned] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(OrderPlacing));
        }
        assert!(PartiallyFailed.is_terminal());
        assert!(!PaymentPending.is_terminal());
    }

    #[test]
    fn paid_states_start_at_capture() {
        assert!(!CartCommitted.is_paid());
        assert!(!PaymentAborted.is_paid());
        assert!(PaymentCaptured.is_paid());
        assert!(PartiallyFailed.is_paid());
    }
}
