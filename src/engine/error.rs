use crate::model::BookingStatus;

use super::conflict::Rejection;

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    NotFound { kind: &'static str, id: String },
    Closed(String),
    SlotUnavailable(Rejection),
    /// Deliberately carries nothing: malformed, unknown and rotated tokens
    /// are indistinguishable to the caller.
    TokenInvalid,
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    Storage(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Closed(_) => "closed",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::TokenInvalid => "token_invalid",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Storage(_) => "storage_error",
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound { .. } => "P0002",
            EngineError::Closed(_) => "P0001",
            EngineError::SlotUnavailable(_) => "40001",
            EngineError::TokenInvalid => "28000",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::Storage(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            EngineError::Closed(msg) => write!(f, "closed: {msg}"),
            EngineError::SlotUnavailable(Rejection::Overlap { booking_id }) => {
                write!(f, "slot unavailable: overlaps booking {booking_id}")
            }
            EngineError::SlotUnavailable(Rejection::AtCapacity { occupancy, capacity }) => {
                write!(f, "slot unavailable: {occupancy} of {capacity} places taken")
            }
            EngineError::SlotUnavailable(Rejection::LockTimeout) => {
                write!(f, "slot unavailable: resource busy, try again")
            }
            EngineError::TokenInvalid => write!(f, "manage token is not valid"),
            EngineError::InvalidTransition { from, to } if from == to => {
                write!(f, "booking is {from} and can no longer be changed")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::Storage(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_sqlstates_are_distinct() {
        let errors = [
            EngineError::Validation("x".into()),
            EngineError::not_found("service", 3),
            EngineError::Closed("x".into()),
            EngineError::SlotUnavailable(Rejection::LockTimeout),
            EngineError::TokenInvalid,
            EngineError::InvalidTransition {
                from: BookingStatus::Cancelled,
                to: BookingStatus::Confirmed,
            },
            EngineError::Storage("disk".into()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        let states: std::collections::HashSet<_> = errors.iter().map(|e| e.sqlstate()).collect();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(states.len(), errors.len());
    }

    #[test]
    fn display_messages() {
        assert_eq!(EngineError::not_found("agent", 9).to_string(), "agent not found: 9");
        assert_eq!(
            EngineError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled
            }
            .to_string(),
            "cannot move booking from completed to cancelled"
        );
        assert_eq!(
            EngineError::SlotUnavailable(Rejection::AtCapacity { occupancy: 3, capacity: 3 }).to_string(),
            "slot unavailable: 3 of 3 places taken"
        );
    }
}
