use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::model::BookingStatus;

use super::EngineError;

/// Who is asking for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Admin,
    /// Payment gateway callback.
    Payment,
    /// Holder of the manage token.
    Customer,
    /// External completion sweep.
    System,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Actor::Admin => "admin",
            Actor::Payment => "payment",
            Actor::Customer => "customer",
            Actor::System => "system",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Actor::Admin),
            "payment" => Ok(Actor::Payment),
            "customer" => Ok(Actor::Customer),
            "system" => Ok(Actor::System),
            other => Err(format!("unknown actor: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in the requested state; nothing is written.
    NoOp,
    Apply,
}

/// Decide whether `actor` may move a booking from `from` to `to`.
/// `elapsed` is whether the booking's end is at or before now.
pub fn check_transition(
    from: BookingStatus,
    to: BookingStatus,
    actor: Actor,
    elapsed: bool,
) -> Result<Transition, EngineError> {
    use Actor::*;
    use BookingStatus::*;

    if from == to {
        return Ok(Transition::NoOp);
    }
    let allowed = match (from, to) {
        (Pending | PendingPayment, Confirmed) => matches!(actor, Admin | Payment),
        (PendingPayment, Cancelled) => matches!(actor, Admin | Payment | Customer),
        (Pending | Confirmed, Cancelled) => matches!(actor, Admin | Customer),
        (Confirmed, Completed) => elapsed && matches!(actor, Admin | System),
        _ => false,
    };
    if allowed {
        Ok(Transition::Apply)
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Statuses a booking may be created in.
pub fn is_initial(status: BookingStatus) -> bool {
    matches!(
        status,
        BookingStatus::Pending | BookingStatus::PendingPayment | BookingStatus::Confirmed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const ALL: [BookingStatus; 5] = [Pending, PendingPayment, Confirmed, Cancelled, Completed];
    const ACTORS: [Actor; 4] = [Actor::Admin, Actor::Payment, Actor::Customer, Actor::System];

    fn ok(from: BookingStatus, to: BookingStatus, actor: Actor) -> bool {
        check_transition(from, to, actor, true).is_ok()
    }

    #[test]
    fn self_transition_is_noop() {
        for s in ALL {
            for a in ACTORS {
                assert_eq!(check_transition(s, s, a, false).unwrap(), Transition::NoOp);
            }
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Cancelled, Completed] {
            for to in ALL.into_iter().filter(|t| *t != from) {
                for a in ACTORS {
                    assert!(!ok(from, to, a), "{from} -> {to} by {a}");
                }
            }
        }
    }

    #[test]
    fn confirmation_is_admin_or_payment() {
        for from in [Pending, PendingPayment] {
            assert!(ok(from, Confirmed, Actor::Admin));
            assert!(ok(from, Confirmed, Actor::Payment));
            assert!(!ok(from, Confirmed, Actor::Customer));
            assert!(!ok(from, Confirmed, Actor::System));
        }
    }

    #[test]
    fn customer_can_cancel_but_system_cannot() {
        for from in [Pending, PendingPayment, Confirmed] {
            assert!(ok(from, Cancelled, Actor::Customer));
            assert!(ok(from, Cancelled, Actor::Admin));
            assert!(!ok(from, Cancelled, Actor::System));
        }
        assert!(ok(PendingPayment, Cancelled, Actor::Payment));
        assert!(!ok(Confirmed, Cancelled, Actor::Payment));
    }

    #[test]
    fn completion_needs_elapsed_time() {
        assert!(check_transition(Confirmed, Completed, Actor::System, true).is_ok());
        assert!(check_transition(Confirmed, Completed, Actor::Admin, true).is_ok());
        let err = check_transition(Confirmed, Completed, Actor::System, false).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: Confirmed, to: Completed }));
        assert!(!ok(Confirmed, Completed, Actor::Customer));
        assert!(!ok(Pending, Completed, Actor::Admin));
    }

    #[test]
    fn nothing_goes_back_to_pending() {
        for from in [PendingPayment, Confirmed] {
            for a in ACTORS {
                assert!(!ok(from, Pending, a));
            }
        }
        assert!(!ok(Pending, PendingPayment, Actor::Admin));
        assert!(!ok(Confirmed, PendingPayment, Actor::Payment));
    }

    #[test]
    fn actor_parsing() {
        assert_eq!("Payment".parse::<Actor>().unwrap(), Actor::Payment);
        assert!("robot".parse::<Actor>().is_err());
        assert!(is_initial(PendingPayment));
        assert!(!is_initial(Completed));
    }
}
