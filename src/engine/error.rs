use ulid::Ulid;

use crate::model::{InvalidRange, TimeRange};

#[derive(Debug)]
pub enum EngineError {
    InvalidRange(InvalidRange),
    InvalidRule(String),
    OutOfBounds {
        slot_id: Ulid,
        slot_range: TimeRange,
        requested: TimeRange,
    },
    /// A direct slot submission overlaps an existing slot of the same provider.
    SlotOverlap(Ulid),
    SlotNotFound(Ulid),
    NotFound(Ulid),
    /// Requested range overlaps this active booking.
    SlotConflict(Ulid),
    /// Exclusivity on this slot was not acquired within the configured wait.
    Timeout(Ulid),
    Unauthorized(&'static str),
    AlreadyCancelled(Ulid),
    ChangeWindowClosed(Ulid),
    SlotHasBookings(Ulid),
    LimitExceeded(&'static str),
    InvariantViolation(String),
    WalError(String),
}

/// Coarse classification used for logging, metrics and wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller input is structurally wrong; retrying the same request is pointless.
    Validation,
    /// Transient; safe to retry after re-reading availability.
    Contention,
    NotFound,
    /// Well-formed but not permitted in the current state.
    Refused,
    /// Engine bug or storage failure; never shown to callers in detail.
    Internal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidRange(_)
            | EngineError::InvalidRule(_)
            | EngineError::OutOfBounds { .. }
            | EngineError::SlotOverlap(_)
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::SlotConflict(_) | EngineError::Timeout(_) => ErrorClass::Contention,
            EngineError::SlotNotFound(_) | EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::Unauthorized(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::ChangeWindowClosed(_)
            | EngineError::SlotHasBookings(_) => ErrorClass::Refused,
            EngineError::InvariantViolation(_) | EngineError::WalError(_) => ErrorClass::Internal,
        }
    }

    /// Short stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::InvalidRule(_) => "invalid_rule",
            EngineError::OutOfBounds { .. } => "out_of_bounds",
            EngineError::SlotOverlap(_) => "slot_overlap",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::NotFound(_) => "not_found",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::Timeout(_) => "timeout",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::ChangeWindowClosed(_) => "change_window_closed",
            EngineError::SlotHasBookings(_) => "slot_has_bookings",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl From<InvalidRange> for EngineError {
    fn from(e: InvalidRange) -> Self {
        EngineError::InvalidRange(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(e) => write!(f, "{e}"),
            EngineError::InvalidRule(msg) => write!(f, "invalid rule: {msg}"),
            EngineError::OutOfBounds {
                slot_id,
                slot_range,
                requested,
            } => write!(
                f,
                "requested {requested} is outside slot {slot_id} ({slot_range})"
            ),
            EngineError::SlotOverlap(id) => write!(f, "overlaps existing slot: {id}"),
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SlotConflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::Timeout(id) => write!(f, "timed out waiting for slot: {id}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking already cancelled: {id}"),
            EngineError::ChangeWindowClosed(id) => {
                write!(f, "booking {id} starts too soon to be changed")
            }
            EngineError::SlotHasBookings(id) => {
                write!(f, "cannot remove slot {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
